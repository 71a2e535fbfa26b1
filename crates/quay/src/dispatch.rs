//! Request dispatch
//!
//! The [`Dispatcher`] is assembled once by the builder and shared immutably by
//! every connection. For each request it:
//!
//! 1. strips the context root (paths outside it are 404)
//! 2. answers websocket upgrades for registered endpoint paths
//! 3. runs matching middleware `before` hooks
//! 4. picks the target by URL pattern precedence and runs it, catching
//!    errors and panics
//! 5. renders errors and runs middleware `after` hooks in reverse

use crate::error_page::{ErrorContext, ErrorRenderer};
use crate::handlers::websocket::{self, HandshakeModifier, WebSocketRegistration, WebSocketRoutes};
use crate::handlers::StaticFiles;
use crate::middleware::{self, MiddlewareChain, MiddlewareRegistration};
use crate::multipart::{self, MultipartConfig};
use crate::response::FileRegion;
use crate::{
    Error, HandlerError, HandlerResult, Method, Request, Response, RestApplication, Result,
    RouteHandler, StaticServingConfig, StatusCode,
};
use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{HeaderName, HeaderValue};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use quay_router::{PatternTable, UrlPattern};
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

/// What a URL pattern resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Index into `Dispatcher::routes`
    Route(usize),
    Rest,
    Static,
}

/// Everything the builder collected, validated
pub(crate) struct Composition {
    pub(crate) context_root: String,
    pub(crate) routes: Vec<RouteHandler>,
    pub(crate) middleware: Vec<MiddlewareRegistration>,
    pub(crate) websockets: Vec<WebSocketRegistration>,
    pub(crate) subprotocols: Vec<String>,
    pub(crate) handshake_modifier: Option<Arc<dyn HandshakeModifier>>,
    pub(crate) rest: Option<RestApplication>,
    pub(crate) renderer: Arc<dyn ErrorRenderer>,
    pub(crate) static_files: StaticServingConfig,
    pub(crate) max_body_size: usize,
}

/// Immutable routing state shared by all connections
pub(crate) struct Dispatcher {
    context_root: String,
    table: PatternTable<Target>,
    routes: Vec<RouteHandler>,
    middleware: MiddlewareChain,
    websockets: WebSocketRoutes,
    rest: Option<RestApplication>,
    static_files: Option<StaticFiles>,
    renderer: Arc<dyn ErrorRenderer>,
    max_body_size: usize,
}

impl Dispatcher {
    /// Build the routing table
    ///
    /// Route patterns are mapped first, then the REST application mount,
    /// then static serving as the default target unless a route claims `/`.
    pub(crate) fn compose(c: Composition) -> Result<Self> {
        let mut table = PatternTable::new();

        for (index, route) in c.routes.iter().enumerate() {
            for raw in route.patterns.iter().filter(|p| !p.trim().is_empty()) {
                let pattern = UrlPattern::parse(raw)
                    .map_err(|e| Error::InvalidPattern(format!("{} ({})", e, route.name)))?;
                table
                    .insert(&pattern, Target::Route(index))
                    .map_err(|e| Error::InvalidPattern(format!("{} ({})", e, route.name)))?;
            }
        }

        if let Some(rest) = &c.rest {
            table.insert(&rest.mount_pattern()?, Target::Rest)?;
            tracing::info!(path = rest.path(), resources = rest.len(), "Mounted REST application");
        }

        let rest_at_root = c.rest.as_ref().is_some_and(|rest| rest.path() == "/");
        let static_files = if !c.static_files.enabled {
            tracing::info!("Static file serving disabled");
            None
        } else if table.has_default() {
            tracing::info!("Static file serving shadowed by a route mapped to '/'");
            None
        } else if rest_at_root {
            tracing::info!("Static file serving shadowed by the REST application mounted at '/'");
            None
        } else {
            table.insert(&UrlPattern::Default, Target::Static)?;
            tracing::info!(root = %c.static_files.root.display(), "Serving static files");
            Some(StaticFiles::new(c.static_files))
        };

        let mut chain = MiddlewareChain::new();
        for registration in &c.middleware {
            chain.add(registration)?;
        }

        let websockets = WebSocketRoutes::new(c.websockets, c.subprotocols, c.handshake_modifier)?;

        tracing::info!(
            context_root = %c.context_root,
            routes = c.routes.len(),
            middleware = chain.len(),
            websocket_endpoints = websockets.len(),
            "Dispatcher composed"
        );

        Ok(Self {
            context_root: c.context_root,
            table,
            routes: c.routes,
            middleware: chain,
            websockets,
            rest: c.rest,
            static_files,
            renderer: c.renderer,
            max_body_size: c.max_body_size,
        })
    }

    /// Handle one request from a connection
    pub(crate) async fn handle(
        &self,
        mut req: hyper::Request<Incoming>,
        remote: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> hyper::Response<ResponseBody> {
        let uri = req.uri().path().to_string();
        let method = req.method().as_str().parse::<Method>().ok();
        let accept = req
            .headers()
            .get(http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let accept = accept.as_deref();

        let Some(path) = self.strip_context_root(&uri).map(str::to_string) else {
            return to_hyper_response(self.render_error(HandlerError::not_found(), method, &uri, accept));
        };

        // Middleware does not apply to upgrades
        if websocket::is_websocket_upgrade(req.headers()) {
            if let Some(registration) = self.websockets.get(&path) {
                let res = self
                    .websockets
                    .upgrade(registration, &mut req, shutdown)
                    .unwrap_or_else(|e| self.render_error(e, method, &uri, accept));
                return to_hyper_response(res);
            }
        }

        let Some(method) = method else {
            let err = HandlerError::new(StatusCode::NOT_IMPLEMENTED, "Unsupported method");
            return to_hyper_response(self.render_error(err, None, &uri, accept));
        };

        let (parts, body) = req.into_parts();
        let mut request = Request::new(method, path);
        request.query = parts.uri.query().map(str::to_string);
        request.headers = parts
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        request.context_path = if self.context_root == "/" {
            String::new()
        } else {
            self.context_root.clone()
        };
        request.remote_addr = Some(remote);

        // Multipart routes decode the body as it arrives, under their own limits
        let pending = if self.multipart_config(&request.path).is_some() {
            Some(body)
        } else {
            match self.read_body(body).await {
                Ok(bytes) => {
                    request.body = bytes;
                    None
                }
                Err(err) => {
                    tracing::debug!(%remote, status = err.status.as_u16(), "Rejected request body");
                    return to_hyper_response(self.render_error(err, Some(method), &uri, accept));
                }
            }
        };

        to_hyper_response(self.respond(request, pending, &uri, accept).await)
    }

    /// Run middleware and the target, turning any panic into a 500
    async fn respond(
        &self,
        request: Request,
        pending: Option<Incoming>,
        uri: &str,
        accept: Option<&str>,
    ) -> Response {
        let method = request.method;
        match AssertUnwindSafe(self.process(request, pending, uri, accept))
            .catch_unwind()
            .await
        {
            Ok(res) => res,
            Err(panic) => {
                tracing::error!(path = %uri, panic = panic_message(panic.as_ref()), "Middleware panicked");
                self.render_error(
                    HandlerError::internal("Request handling panicked"),
                    Some(method),
                    uri,
                    accept,
                )
            }
        }
    }

    /// Middleware `before` hooks, the target, then `after` hooks in reverse
    async fn process(
        &self,
        mut request: Request,
        pending: Option<Incoming>,
        uri: &str,
        accept: Option<&str>,
    ) -> Response {
        let method = request.method;
        let chain = self.middleware.matching(&request.path);
        let (ran, early) = middleware::run_before(&chain, &mut request);
        let head = request.head();

        let mut response = match early {
            Some(res) => res,
            None => match AssertUnwindSafe(self.route(request, pending)).catch_unwind().await {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => self.render_error(err, Some(method), uri, accept),
                Err(panic) => {
                    tracing::error!(path = %uri, panic = panic_message(panic.as_ref()), "Request handler panicked");
                    self.render_error(
                        HandlerError::internal("Request handler panicked"),
                        Some(method),
                        uri,
                        accept,
                    )
                }
            },
        };

        middleware::run_after(&chain, ran, &head, &mut response);
        response
    }

    /// Collect a body under `max_body_size`
    async fn read_body(&self, body: Incoming) -> std::result::Result<Bytes, HandlerError> {
        match Limited::new(body, self.max_body_size).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(HandlerError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            )),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read request body");
                Err(HandlerError::bad_request("Failed to read request body"))
            }
        }
    }

    /// Multipart settings of the route a path maps to
    fn multipart_config(&self, path: &str) -> Option<&MultipartConfig> {
        match self.table.lookup(path)?.value {
            Target::Route(index) => self.routes.get(*index)?.multipart.as_ref(),
            _ => None,
        }
    }

    /// Path relative to the context root, or `None` outside it
    fn strip_context_root<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.context_root == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.context_root.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Select the target for a request and run it
    ///
    /// `pending` is the unread body of a request that was routed to a
    /// multipart handler before middleware ran.
    async fn route(&self, mut request: Request, pending: Option<Incoming>) -> HandlerResult {
        let (target, servlet_path, path_info) = {
            let m = self.table.lookup(&request.path).ok_or_else(HandlerError::not_found)?;
            (*m.value, m.servlet_path.to_string(), m.path_info.map(str::to_string))
        };
        request.servlet_path = servlet_path;
        request.path_info = path_info;

        let multipart = match target {
            Target::Route(index) => self.routes.get(index).and_then(|r| r.multipart.as_ref()),
            _ => None,
        };
        match (multipart, pending) {
            (Some(config), Some(body)) => {
                let decoded = multipart::decode_body(request.content_type(), body, config).await;
                request.parts = self.decode_parts(decoded)?;
            }
            (Some(config), None) => {
                let decoded = multipart::decode(request.content_type(), &request.body, config).await;
                request.parts = self.decode_parts(decoded)?;
            }
            // Middleware moved the request away from the multipart route
            (None, Some(body)) => request.body = self.read_body(body).await?,
            (None, None) => {}
        }

        match target {
            Target::Route(index) => {
                let route = self.routes.get(index).ok_or_else(HandlerError::not_found)?;
                route.handler.call(request).await
            }
            Target::Rest => match &self.rest {
                Some(rest) => rest.dispatch(request).await,
                None => Err(HandlerError::not_found()),
            },
            Target::Static => match &self.static_files {
                Some(files) => files.handle(&request).await,
                None => Err(HandlerError::not_found()),
            },
        }
    }

    fn decode_parts(
        &self,
        decoded: std::result::Result<Vec<multipart::Part>, multipart::MultipartError>,
    ) -> std::result::Result<Vec<multipart::Part>, HandlerError> {
        decoded.map_err(|e| {
            tracing::debug!(error = %e, "Rejected multipart request");
            HandlerError::from(e)
        })
    }

    /// Render an error through the configured renderer
    ///
    /// The error's status wins over whatever status the renderer set.
    fn render_error(
        &self,
        err: HandlerError,
        method: Option<Method>,
        uri: &str,
        accept: Option<&str>,
    ) -> Response {
        if err.status.is_server_error() {
            tracing::warn!(status = err.status.as_u16(), path = uri, message = %err.message, "Request failed");
        }

        let ctx = ErrorContext {
            status: err.status,
            message: Some(&err.message),
            method,
            uri,
            accept,
        };
        let mut res = self.renderer.render(&ctx);
        res.status = err.status;
        for (name, value) in err.headers {
            res.set_header(name, value);
        }
        res
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Body type handed to hyper: buffered or streamed from a file
pub(crate) type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Chunk size for streamed files
const FILE_CHUNK: u64 = 64 * 1024;

/// Convert our Response to hyper Response
///
/// Headers that are not valid HTTP are dropped.
pub(crate) fn to_hyper_response(res: Response) -> hyper::Response<ResponseBody> {
    let streamed_len = res.file.as_ref().map(|region| region.len);
    let body: ResponseBody = match res.file {
        Some(region) => stream_file(region),
        None => Full::new(res.body).map_err(|never| match never {}).boxed_unsync(),
    };

    let mut out = hyper::Response::new(body);
    *out.status_mut() = res.status;

    let headers = out.headers_mut();
    for (name, value) in res.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid response header"),
        }
    }
    if let Some(len) = streamed_len {
        headers
            .entry(http::header::CONTENT_LENGTH)
            .or_insert_with(|| HeaderValue::from(len));
    }
    out
}

enum FileStream {
    Pending(FileRegion),
    Reading(tokio::fs::File, u64),
    Done,
}

/// Read a file region in chunks as the connection asks for them
fn stream_file(region: FileRegion) -> ResponseBody {
    let frames = futures_util::stream::unfold(FileStream::Pending(region), |state| async move {
        let (mut file, remaining) = match state {
            FileStream::Pending(region) => match open_region(&region).await {
                Ok(file) => (file, region.len),
                Err(e) => {
                    tracing::warn!(path = %region.path.display(), error = %e, "Failed to open streamed file");
                    return Some((Err(e), FileStream::Done));
                }
            },
            FileStream::Reading(file, remaining) => (file, remaining),
            FileStream::Done => return None,
        };
        if remaining == 0 {
            return None;
        }

        let mut chunk = vec![0u8; remaining.min(FILE_CHUNK) as usize];
        match file.read(&mut chunk).await {
            Ok(0) => Some((
                Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "file truncated while streaming")),
                FileStream::Done,
            )),
            Ok(n) => {
                chunk.truncate(n);
                Some((
                    Ok(Frame::data(Bytes::from(chunk))),
                    FileStream::Reading(file, remaining - n as u64),
                ))
            }
            Err(e) => Some((Err(e), FileStream::Done)),
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

async fn open_region(region: &FileRegion) -> std::io::Result<tokio::fs::File> {
    let mut file = tokio::fs::File::open(&region.path).await?;
    if region.offset > 0 {
        file.seek(std::io::SeekFrom::Start(region.offset)).await?;
    }
    Ok(file)
}
