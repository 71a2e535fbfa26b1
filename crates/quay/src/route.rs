//! Route handlers
//!
//! A [`RouteHandler`] pairs request-handling logic with the URL patterns it is
//! mapped to. Patterns are passed at registration time.

use crate::multipart::{MultipartConfig, MultipartError};
use crate::response::reason_phrase;
use crate::{Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result produced by a handler
pub type HandlerResult = std::result::Result<Response, HandlerError>;

/// A fault raised while handling a request
///
/// Rendered by the server's error renderer; extra headers are added to the
/// rendered response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{status}: {message}")]
pub struct HandlerError {
    pub status: StatusCode,
    pub message: String,
    pub headers: Vec<(String, String)>,
}

impl HandlerError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, reason_phrase(StatusCode::NOT_FOUND))
    }

    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            reason_phrase(StatusCode::METHOD_NOT_ALLOWED),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Attach a header to the rendered error response
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::internal(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::bad_request(e.to_string())
    }
}

impl From<MultipartError> for HandlerError {
    fn from(e: MultipartError) -> Self {
        HandlerError::new(e.status(), e.to_string())
    }
}

/// Request-handling logic
///
/// Implemented for async closures `Fn(Request) -> impl Future<Output = HandlerResult>`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(req))
    }
}

/// A handler tagged with the URL patterns it serves
#[derive(Clone)]
pub struct RouteHandler {
    pub(crate) name: String,
    pub(crate) patterns: Vec<String>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) multipart: Option<MultipartConfig>,
}

impl RouteHandler {
    /// Map a handler to one or more URL patterns
    ///
    /// ```
    /// use quay::{HandlerResult, Request, Response, RouteHandler};
    ///
    /// async fn hello(_req: Request) -> HandlerResult {
    ///     Ok(Response::text("hello"))
    /// }
    ///
    /// let route = RouteHandler::new(["/hello", "/hi"], hello);
    /// assert_eq!(route.patterns(), ["/hello", "/hi"]);
    /// ```
    pub fn new<I, S, H>(patterns: I, handler: H) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        H: Handler,
    {
        Self {
            name: std::any::type_name::<H>().to_string(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            handler: Arc::new(handler),
            multipart: None,
        }
    }

    /// Name used in logs and configuration errors
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Decode `multipart/form-data` bodies before the handler runs
    pub fn multipart(mut self, config: MultipartConfig) -> Self {
        self.multipart = Some(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn multipart_config(&self) -> Option<&MultipartConfig> {
        self.multipart.as_ref()
    }

    /// True if at least one pattern is non-blank
    pub(crate) fn is_declared(&self) -> bool {
        self.patterns.iter().any(|p| !p.trim().is_empty())
    }
}

impl std::fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteHandler")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("multipart", &self.multipart)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    async fn echo_path(req: Request) -> HandlerResult {
        Ok(Response::text(req.path))
    }

    #[test]
    fn test_route_declaration() {
        let route = RouteHandler::new(["/test0"], echo_path);
        assert!(route.is_declared());
        assert!(route.name().contains("echo_path"));

        let empty = RouteHandler::new(Vec::<String>::new(), echo_path);
        assert!(!empty.is_declared());

        let blank = RouteHandler::new(["  "], echo_path).named("blank");
        assert!(!blank.is_declared());
        assert_eq!(blank.name(), "blank");
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let route = RouteHandler::new(["/x"], |req: Request| async move {
            Ok::<_, HandlerError>(Response::text(format!("{} {}", req.method, req.path)))
        });

        let res = route.handler.call(Request::new(Method::Get, "/x")).await.unwrap();
        assert_eq!(res.body_string().as_deref(), Some("GET /x"));
    }

    #[test]
    fn test_error_conversions() {
        let err: HandlerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = HandlerError::method_not_allowed().with_header("Allow", "GET");
        assert_eq!(err.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(err.headers, vec![("Allow".to_string(), "GET".to_string())]);
    }
}
