//! Storage error types.

use crate::object_id::ObjectId;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate key: _id {0} already exists")]
    DuplicateKey(ObjectId),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("storage closed")]
    Closed,

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Returns whether the failure came from the backend being unreachable
    /// or failing I/O, as opposed to the data or the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Backend(_))
    }
}
