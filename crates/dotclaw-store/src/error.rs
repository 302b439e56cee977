//! Store error type.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking task was cancelled or panicked.
    #[error("store task failed: {0}")]
    Join(String),

    /// A row referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store was closed and can no longer be used.
    #[error("store is closed")]
    Closed,

    /// Serialization of a JSON column failed.
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for dotclaw_types::DotclawError {
    fn from(e: StoreError) -> Self {
        dotclaw_types::DotclawError::Store(e.to_string())
    }
}
