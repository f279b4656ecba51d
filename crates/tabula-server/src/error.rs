//! Error types for the Tabula server.

use std::path::PathBuf;

/// Server error type.
///
/// Wire-level failures are not represented here: the protocol reports those
/// to the offending client as `error <code> <text>` lines and the server
/// keeps running. This type covers the conditions that can keep the server
/// from starting or persisting state.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// IO error.
    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Failed to bind the listen socket.
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    /// The server was started twice.
    #[error("server is already running")]
    AlreadyRunning,
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: e.to_string(),
        }
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
