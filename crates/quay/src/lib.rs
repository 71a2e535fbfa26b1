//! quay: Builder-style HTTP server composition
//!
//! Route handlers, middleware, websocket endpoints, a REST application and
//! static file serving are registered on a [`ServerBuilder`] and composed into
//! one hyper server mounted under a context root.
//!
//! ```no_run
//! use quay::{HandlerResult, Request, Response, RouteHandler, WebServer};
//!
//! async fn hello(req: Request) -> HandlerResult {
//!     Ok(Response::text(format!("hello from {}", req.path)))
//! }
//!
//! let server = WebServer::builder()
//!     .route(RouteHandler::new(["/hello"], hello))
//!     .static_content_dir("public")
//!     .build()?;
//! server.start_in_background()?;
//! // ...
//! server.stop();
//! # Ok::<(), quay::Error>(())
//! ```
//!
//! ## URL Patterns
//! - `/exact/path`
//! - `/prefix/*`
//! - `*.ext`
//! - `/` - default target (static files unless a route claims it)

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod builder;
pub mod config;
mod dispatch;
pub mod error;
pub mod error_page;
pub mod handlers;
pub mod middleware;
pub mod multipart;
pub mod request;
pub mod response;
pub mod rest;
pub mod route;
pub mod server;
pub mod telemetry;

// Re-exports
pub use builder::ServerBuilder;
pub use config::{ServerConfig, StaticServingConfig};
pub use error::{Error, Result};
pub use error_page::{DefaultErrorRenderer, ErrorContext, ErrorRenderer};
pub use middleware::{Middleware, MiddlewareRegistration};
pub use multipart::{MultipartConfig, Part};
pub use request::{Method, Request, RequestBuilder};
pub use response::{FileRegion, Response, ResponseBuilder, StatusCode};
pub use rest::RestApplication;
pub use route::{Handler, HandlerError, HandlerResult, RouteHandler};
pub use server::{ServerHandle, ServerState};

// Handlers re-exports
pub use handlers::websocket;
pub use handlers::StaticFiles;

/// The composed server, as returned by [`ServerBuilder::build`]
pub type WebServer = ServerHandle;
