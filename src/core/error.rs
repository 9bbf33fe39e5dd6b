use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerdictError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Reasoner failure in stage '{stage}' ({model}): {reason}")]
    ReasonerFailure {
        stage: String,
        model: String,
        reason: String,
    },
    #[error("verification failed at index {index}: {reason}")]
    ChainIntegrityError { index: usize, reason: String },
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Concurrency violation: expected tail {expected}, found {actual}")]
    ConcurrencyViolation { expected: String, actual: String },
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Backend-side failure reported by a [`crate::core::stage::Reasoner`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReasonerError {
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("backend returned empty output")]
    Empty,
}
