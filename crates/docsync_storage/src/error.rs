//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Per-document write conflicts are not errors at this level; they are
/// reported inside [`crate::BulkWriteResponse::error`].
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The store could not be reached or the call failed mid-way.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The storage instance is closed.
    #[error("storage is closed")]
    Closed,

    /// A checkpoint handed to the store was not produced by it.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// A document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Creates a retryable unavailability error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable unavailability error.
    pub fn unavailable_fatal(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable { retryable: true, .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(StorageError::unavailable("connection reset").is_retryable());
        assert!(!StorageError::unavailable_fatal("disk full").is_retryable());
        assert!(!StorageError::Closed.is_retryable());
        assert!(!StorageError::InvalidCheckpoint("x".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(StorageError::Closed.to_string(), "storage is closed");
        let err = StorageError::unavailable("timeout");
        assert!(err.to_string().contains("timeout"));
    }
}
