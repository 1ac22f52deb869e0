//! Error types for the scan engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scanning sources.
#[derive(Error, Debug)]
pub enum Error {
    /// Durable state could not be read or written.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// I/O error (run history files, external commands).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient failure fetching a single source.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// The upstream signalled rate limiting or blocking.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A programming invariant was violated.
    #[error("Logic error: {0}")]
    Logic(String),

    /// A scan run is already active.
    #[error("A scan run is already in progress")]
    RunInProgress,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error should abort the remaining sources of a run.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    /// Whether this error came from durable storage.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }
}
