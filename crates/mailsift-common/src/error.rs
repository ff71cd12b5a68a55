//! Error types for mailsift

use thiserror::Error;

/// Main error type for mailsift
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limit exceeded for mailbox {0}")]
    RateLimitExceeded(i64),

    #[error("Envelope queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailsift
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Cache(_) => "CACHE_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::RateLimitExceeded(_) => "RATE_LIMITED",
            Error::QueueClosed => "QUEUE_CLOSED",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure is transient I/O that may succeed on a later message
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Cache(_))
    }
}
