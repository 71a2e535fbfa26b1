//! Error types for quay

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for quay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while composing or running a server
#[derive(Debug, Error)]
pub enum Error {
    /// A route handler or middleware was registered without a URL pattern
    #[error("{kind} '{name}' must declare at least one URL pattern")]
    MissingRouteDeclaration { kind: &'static str, name: String },

    /// A websocket registration has no usable endpoint path
    #[error("Websocket endpoint {0} must declare a path starting with '/'")]
    MissingEndpointDeclaration(String),

    /// A URL pattern could not be parsed or is mapped twice
    #[error("Invalid URL pattern: {0}")]
    InvalidPattern(String),

    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Host/port do not form a socket address
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// The server was stopped and cannot be started again
    #[error("Server has been stopped; compose a new one to restart")]
    AlreadyStopped,

    /// The async runtime could not be created
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

impl From<quay_router::PatternError> for Error {
    fn from(e: quay_router::PatternError) -> Self {
        Error::InvalidPattern(e.to_string())
    }
}
