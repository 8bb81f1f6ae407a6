//! Server error types.

use blogd_protocol::ErrorCode;
use blogd_storage::StorageError;
use thiserror::Error;

/// Server errors.
///
/// Every failure a caller can observe maps to exactly one stable
/// `ErrorCode`; the message carries the underlying cause.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] blogd_protocol::ProtocolError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    /// The backend failed to serve the call; retrying may succeed.
    #[error("{0}")]
    Unavailable(String),

    /// A fault retrying cannot fix, such as a stored document that does not
    /// decode or a backend breaking its contract.
    #[error("{0}")]
    Internal(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::Internal,
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Storage(_) => ErrorCode::Internal,
            ServerError::Json(_) => ErrorCode::Internal,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::Unavailable(_) => ErrorCode::Internal,
            ServerError::Internal(_) => ErrorCode::Internal,
            ServerError::ShuttingDown => ErrorCode::Internal,
        }
    }

    /// Returns whether a caller may reasonably retry the request.
    ///
    /// The server itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Unavailable(_) => true,
            ServerError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Maps a storage failure, prefixing `context` to its message.
    pub(crate) fn from_storage(context: &str, error: StorageError) -> Self {
        let message = format!("{}: {}", context, error);
        if error.is_transient() {
            ServerError::Unavailable(message)
        } else {
            ServerError::Internal(message)
        }
    }
}
