//! Error taxonomy for the retrieval engine.
//!
//! Most operations degrade instead of failing: a transient provider error
//! yields "no vector", a corrupt index file triggers a rebuild, a failed
//! re-rank batch keeps its original order. The variants below are the ones
//! that callers can still observe.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Provider kept failing after retries.
    #[error("transient provider failure: {0}")]
    TransientProvider(String),

    #[error("index {name} is corrupt: {reason}")]
    IndexCorruption { name: String, reason: String },

    #[error("duplicate key {0}")]
    DuplicateKey(i64),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("rerank failed: {0}")]
    Rerank(String),

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-retryable provider failure (client error, bad payload, disabled provider).
    #[error("embedding provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Index(#[from] crate::index::IndexError),

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Errors that a retry loop may try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientProvider(_))
    }
}
