//! Error types shared across the server.
//!
//! Transport failures are connection-scoped and only logged; the types here
//! cover what escapes to a caller: start-up failures and handler failures
//! that get rendered into `ERROR:` responses.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned from the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create poll instance: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("handler '{name}' failed to initialize: {source}")]
    HandlerInit {
        name: String,
        #[source]
        source: HandlerError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure inside a handler, converted to `ERROR: <reason>` on the wire.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid expression: {0}")]
    Expression(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("Could not open file {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to write file")]
    FileWrite(#[source] io::Error),

    #[error("Invalid {0} command format")]
    InvalidFormat(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HandlerError {
    /// Render as a wire-level error response.
    pub fn to_response(&self) -> String {
        format!("ERROR: {self}")
    }
}
