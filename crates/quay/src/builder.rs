//! Server composition
//!
//! [`ServerBuilder`] collects everything a server serves and turns it into a
//! bound [`ServerHandle`]:
//!
//! ```no_run
//! use quay::{HandlerResult, Request, Response, RouteHandler, WebServer};
//!
//! async fn hello(_req: Request) -> HandlerResult {
//!     Ok(Response::text("hello"))
//! }
//!
//! let server = WebServer::builder()
//!     .route(RouteHandler::new(["/hello"], hello))
//!     .context_root("/app")
//!     .port(8080)
//!     .build()?;
//! server.start()?;
//! # Ok::<(), quay::Error>(())
//! ```
//!
//! `build` validates every registration before anything is bound; a failed
//! build leaves no socket open.

use crate::dispatch::{Composition, Dispatcher};
use crate::error_page::{DefaultErrorRenderer, ErrorRenderer};
use crate::handlers::websocket::{HandshakeModifier, WebSocketRegistration};
use crate::{
    server, Error, MiddlewareRegistration, RestApplication, Result, RouteHandler, ServerConfig,
    ServerHandle,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Collects routes, middleware, websocket endpoints, a REST application and
/// static serving settings for one server
#[derive(Default)]
pub struct ServerBuilder {
    routes: Vec<RouteHandler>,
    middleware: Vec<MiddlewareRegistration>,
    websockets: Vec<WebSocketRegistration>,
    subprotocols: Vec<String>,
    handshake_modifier: Option<Arc<dyn HandshakeModifier>>,
    rest: Option<RestApplication>,
    renderer: Option<Arc<dyn ErrorRenderer>>,
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // Route handlers

    pub fn route(mut self, route: RouteHandler) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = RouteHandler>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn clear_routes(mut self) -> Self {
        self.routes.clear();
        self
    }

    // Middleware

    pub fn middleware(mut self, middleware: MiddlewareRegistration) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn middlewares(mut self, middleware: impl IntoIterator<Item = MiddlewareRegistration>) -> Self {
        self.middleware.extend(middleware);
        self
    }

    pub fn clear_middlewares(mut self) -> Self {
        self.middleware.clear();
        self
    }

    // WebSockets

    pub fn websocket_endpoint(mut self, endpoint: WebSocketRegistration) -> Self {
        self.websockets.push(endpoint);
        self
    }

    pub fn websocket_endpoints(mut self, endpoints: impl IntoIterator<Item = WebSocketRegistration>) -> Self {
        self.websockets.extend(endpoints);
        self
    }

    pub fn clear_websocket_endpoints(mut self) -> Self {
        self.websockets.clear();
        self
    }

    /// Subprotocols the server supports, in order of preference
    pub fn websocket_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Hook run on every websocket handshake before the upgrade completes
    pub fn websocket_handshake_modifier(mut self, modifier: impl HandshakeModifier) -> Self {
        self.handshake_modifier = Some(Arc::new(modifier));
        self
    }

    // Application and errors

    pub fn rest_application(mut self, application: RestApplication) -> Self {
        self.rest = Some(application);
        self
    }

    pub fn error_renderer(mut self, renderer: impl ErrorRenderer) -> Self {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    /// Path every route is mounted under; blank means `/`
    pub fn context_root(mut self, root: impl Into<String>) -> Self {
        self.config.context_root = root.into();
        self
    }

    // Static files

    pub fn static_content_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.static_files.root = dir.into();
        self
    }

    /// `Cache-Control: max-age` for static files in seconds; negative disables
    /// the header
    pub fn client_browser_cache_max_age(mut self, seconds: i64) -> Self {
        self.config.static_files.max_age = seconds;
        self
    }

    /// In-memory static file cache capacity in bytes
    pub fn max_local_cache_size(mut self, bytes: usize) -> Self {
        self.config.static_files.max_cache_size = bytes;
        self
    }

    pub fn static_file_serving_disabled(mut self, disabled: bool) -> Self {
        self.config.static_files.enabled = !disabled;
        self
    }

    // Listener and runtime

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// How long `stop` waits for open connections
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.config.max_body_size = bytes;
        self
    }

    /// Replace all listener, static serving and context root settings
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate, bind the socket and assemble the server
    ///
    /// The returned handle is not accepting yet; call
    /// [`ServerHandle::start`] or [`ServerHandle::start_in_background`].
    pub fn build(self) -> Result<ServerHandle> {
        self.validate()?;

        let addr = server::resolve(&self.config.host, self.config.port)?;
        let context_root = self.config.normalized_context_root();
        let ServerConfig {
            workers,
            static_files,
            shutdown_timeout,
            max_body_size,
            ..
        } = self.config;

        let dispatcher = Dispatcher::compose(Composition {
            context_root,
            routes: self.routes,
            middleware: self.middleware,
            websockets: self.websockets,
            subprotocols: self.subprotocols,
            handshake_modifier: self.handshake_modifier,
            rest: self.rest,
            renderer: self
                .renderer
                .unwrap_or_else(|| Arc::new(DefaultErrorRenderer)),
            static_files,
            max_body_size,
        })?;

        let listener = server::bind(addr)?;
        let handle = ServerHandle::new(dispatcher, listener, workers, shutdown_timeout)?;
        tracing::info!(addr = %handle.local_addr(), workers, "Server composed");
        Ok(handle)
    }

    fn validate(&self) -> Result<()> {
        if let Some(route) = self.routes.iter().find(|r| !r.is_declared()) {
            return Err(Error::MissingRouteDeclaration {
                kind: "Route handler",
                name: route.name.clone(),
            });
        }
        if let Some(middleware) = self.middleware.iter().find(|m| !m.is_declared()) {
            return Err(Error::MissingRouteDeclaration {
                kind: "Middleware",
                name: middleware.name.clone(),
            });
        }
        for endpoint in &self.websockets {
            let path = endpoint.id().path();
            if path.trim().is_empty() || !path.starts_with('/') {
                return Err(Error::MissingEndpointDeclaration(
                    endpoint.id().type_name().to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl ServerHandle {
    /// Start composing a server
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::websocket::{Endpoint, EndpointId, Session, WebSocketMessage};
    use crate::{HandlerResult, Middleware, Request, Response};

    async fn hello(_req: Request) -> HandlerResult {
        Ok(Response::text("hello"))
    }

    struct Noop;

    impl Middleware for Noop {}

    struct Silent;

    impl Endpoint for Silent {
        fn on_message(&mut self, _session: &mut Session, _msg: WebSocketMessage) {}
    }

    fn local() -> ServerBuilder {
        ServerBuilder::new()
            .host("127.0.0.1")
            .port(0)
            .workers(1)
            .static_file_serving_disabled(true)
    }

    #[test]
    fn test_route_without_patterns() {
        let result = local()
            .route(RouteHandler::new(["/ok"], hello))
            .route(RouteHandler::new(Vec::<String>::new(), hello).named("empty"))
            .build();
        match result {
            Err(Error::MissingRouteDeclaration { kind, name }) => {
                assert_eq!(kind, "Route handler");
                assert_eq!(name, "empty");
            }
            other => panic!("unexpected: {:?}", other.map(|s| s.local_addr())),
        }
    }

    #[test]
    fn test_middleware_without_patterns() {
        let result = local()
            .middleware(MiddlewareRegistration::new([" "], Noop).named("noop"))
            .build();
        assert!(matches!(
            result,
            Err(Error::MissingRouteDeclaration { kind: "Middleware", .. })
        ));
    }

    #[test]
    fn test_websocket_without_path() {
        let registration = WebSocketRegistration::dynamic(EndpointId::new::<Silent>("chat"), || {
            Box::new(Silent) as Box<dyn Endpoint>
        });
        match local().websocket_endpoint(registration).build() {
            Err(Error::MissingEndpointDeclaration(name)) => assert!(name.ends_with("Silent")),
            other => panic!("unexpected: {:?}", other.map(|s| s.local_addr())),
        }
    }

    #[test]
    fn test_clear_lists() {
        let server = local()
            .route(RouteHandler::new(Vec::<String>::new(), hello))
            .clear_routes()
            .middleware(MiddlewareRegistration::new(Vec::<String>::new(), Noop))
            .clear_middlewares()
            .websocket_endpoint(WebSocketRegistration::dynamic(
                EndpointId::new::<Silent>(""),
                || Box::new(Silent) as Box<dyn Endpoint>,
            ))
            .clear_websocket_endpoints()
            .build()
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_invalid_address() {
        let result = local().host("definitely not a host").build();
        assert!(matches!(result, Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_config_application() {
        let config = ServerConfig::from_lookup(|key| match key {
            "QUAY_HOST" => Some("127.0.0.1".to_string()),
            "QUAY_PORT" => Some("0".to_string()),
            "QUAY_STATIC_DISABLED" => Some("true".to_string()),
            _ => None,
        });
        let builder = ServerBuilder::new().config(config).client_browser_cache_max_age(2002);
        assert_eq!(builder.config.host, "127.0.0.1");
        assert_eq!(builder.config.static_files.max_age, 2002);
        assert!(!builder.config.static_files.enabled);

        let server = builder.workers(1).build().unwrap();
        assert!(server.local_addr().ip().is_loopback());
    }
}
