//! Error types for tailscribe-core

use thiserror::Error;

/// Main error type for the tailscribe-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Offset cache database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation on a session that was never opened (or already closed)
    #[error("session not open: {0}")]
    SessionNotOpen(String),

    /// Byte source could not serve a session
    #[error("byte source error for {session}: {message}")]
    Source { session: String, message: String },

    /// A background parse task panicked or was cancelled
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether the failure is expected to clear up on a later attempt.
    ///
    /// Parse passes that fail with a transient error leave the session
    /// offset untouched, so the next change event retries the same range.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Source { .. })
    }
}

/// Result type alias for tailscribe-core
pub type Result<T> = std::result::Result<T, Error>;
