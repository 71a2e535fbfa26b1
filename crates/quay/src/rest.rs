//! REST applications
//!
//! A [`RestApplication`] is mounted under an application path (for example
//! `/api`) and dispatches on method and sub-path with the
//! [`quay_router::Router`] trie, so resources may capture parameters:
//!
//! ```
//! use quay::{rest, HandlerResult, Request, RestApplication};
//!
//! async fn user(req: Request) -> HandlerResult {
//!     rest::json(&serde_json::json!({ "id": req.param("id") }))
//! }
//!
//! let app = RestApplication::new("/api").get("/users/{id}", user);
//! assert_eq!(app.path(), "/api");
//! assert_eq!(app.len(), 1);
//! ```

use crate::route::{Handler, HandlerError, HandlerResult};
use crate::{Error, Method, Request, Response, Result};
use quay_router::{Lookup, PatternError, Router, UrlPattern};
use std::sync::Arc;

/// Resources mounted under one application path
pub struct RestApplication {
    path: String,
    router: Router<Arc<dyn Handler>>,
    resources: Vec<(Method, String)>,
    /// First resource that could not be registered, reported when mounted
    conflict: Option<PatternError>,
}

impl RestApplication {
    /// Create an application mounted at `path`
    ///
    /// Blank paths mount at the context root.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: crate::config::normalize_context_root(path.as_ref()),
            router: Router::new(),
            resources: Vec::new(),
            conflict: None,
        }
    }

    /// Register a resource for a method and sub-path
    ///
    /// A sub-path naming a parameter differently from an earlier resource at
    /// the same position is rejected when the server is built.
    pub fn resource<H: Handler>(mut self, method: Method, path: &str, handler: H) -> Self {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        match self.router.insert(method.as_str(), path, handler) {
            Ok(()) => self.resources.push((method, path.to_string())),
            Err(e) => {
                tracing::debug!(method = method.as_str(), path, error = %e, "Rejected REST resource");
                self.conflict.get_or_insert(e);
            }
        }
        self
    }

    pub fn get<H: Handler>(self, path: &str, handler: H) -> Self {
        self.resource(Method::Get, path, handler)
    }

    pub fn post<H: Handler>(self, path: &str, handler: H) -> Self {
        self.resource(Method::Post, path, handler)
    }

    pub fn put<H: Handler>(self, path: &str, handler: H) -> Self {
        self.resource(Method::Put, path, handler)
    }

    pub fn patch<H: Handler>(self, path: &str, handler: H) -> Self {
        self.resource(Method::Patch, path, handler)
    }

    pub fn delete<H: Handler>(self, path: &str, handler: H) -> Self {
        self.resource(Method::Delete, path, handler)
    }

    /// Application path, e.g. `/api`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registered (method, sub-path) pairs
    pub fn resources(&self) -> &[(Method, String)] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Prefix pattern the application is mounted with
    pub(crate) fn mount_pattern(&self) -> Result<UrlPattern> {
        if let Some(conflict) = &self.conflict {
            return Err(Error::InvalidPattern(format!("REST application {}: {}", self.path, conflict)));
        }
        let pattern = if self.path == "/" {
            "/*".to_string()
        } else {
            format!("{}/*", self.path)
        };
        UrlPattern::parse(&pattern)
            .map_err(|e| Error::InvalidPattern(format!("REST application path: {}", e)))
    }

    /// Dispatch a request whose `path_info` is relative to the application path
    pub(crate) async fn dispatch(&self, mut req: Request) -> HandlerResult {
        let sub_path = req.path_info.clone().unwrap_or_else(|| "/".to_string());

        let handler = match self.router.lookup(req.method.as_str(), &sub_path) {
            Lookup::Found(m) => {
                req.params.extend(m.params);
                m.value.clone()
            }
            Lookup::MethodNotAllowed(methods) => {
                return Err(HandlerError::method_not_allowed().with_header("Allow", methods.join(", ")));
            }
            Lookup::NotFound => return Err(HandlerError::not_found()),
        };

        handler.call(req).await
    }
}

impl std::fmt::Debug for RestApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestApplication")
            .field("path", &self.path)
            .field("resources", &self.resources)
            .finish()
    }
}

/// Serialize a value as a JSON response
pub fn json<T: serde::Serialize + ?Sized>(value: &T) -> HandlerResult {
    let body = serde_json::to_vec(value).map_err(|e| HandlerError::internal(e.to_string()))?;
    Ok(Response::json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    async fn message(_req: Request) -> HandlerResult {
        Ok(Response::text("testjaxrsmessage"))
    }

    async fn user(req: Request) -> HandlerResult {
        json(&serde_json::json!({ "id": req.param("id") }))
    }

    fn request(method: Method, path_info: &str) -> Request {
        let mut req = Request::new(method, format!("/api{}", path_info));
        req.servlet_path = "/api".to_string();
        req.path_info = Some(path_info.to_string());
        req
    }

    fn app() -> RestApplication {
        RestApplication::new("/api/")
            .get("/message", message)
            .get("/users/{id}", user)
            .delete("/users/{id}", user)
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(RestApplication::new("api").path(), "/api");
        assert_eq!(RestApplication::new("/api/").path(), "/api");
        assert_eq!(RestApplication::new("").path(), "/");

        assert_eq!(app().mount_pattern().unwrap(), UrlPattern::Prefix("/api".to_string()));
        assert_eq!(RestApplication::new("/").mount_pattern().unwrap(), UrlPattern::Prefix(String::new()));
        assert!(RestApplication::new("/a*b").mount_pattern().is_err());
    }

    #[test]
    fn test_conflicting_param_names_rejected() {
        let app = app().get("/users/{uid}/posts", user);
        assert_eq!(app.len(), 3);
        match app.mount_pattern() {
            Err(Error::InvalidPattern(msg)) => assert!(msg.contains("'uid'") && msg.contains("'id'"), "{}", msg),
            other => panic!("expected invalid pattern, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch() {
        let app = app();

        let res = app.dispatch(request(Method::Get, "/message")).await.unwrap();
        assert_eq!(res.body_string().as_deref(), Some("testjaxrsmessage"));

        let res = app.dispatch(request(Method::Get, "/users/7")).await.unwrap();
        assert_eq!(res.content_type(), Some("application/json"));
        assert_eq!(res.body_string().as_deref(), Some(r#"{"id":"7"}"#));
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let app = app();

        let err = app.dispatch(request(Method::Get, "/nothing")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = app.dispatch(request(Method::Post, "/users/7")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::METHOD_NOT_ALLOWED);
        let allow = &err.headers[0];
        assert_eq!(allow.0, "Allow");
        assert!(allow.1.contains("GET") && allow.1.contains("DELETE"));
    }
}
