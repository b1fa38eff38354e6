//! Top-level error type for the server.

use thiserror::Error;

/// Main error type surfaced to the operator.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Bind(#[from] crate::net::BindError),

    #[error(transparent)]
    Startup(#[from] crate::supervisor::StartupError),

    #[error(transparent)]
    Reexec(#[from] crate::supervisor::ReexecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
