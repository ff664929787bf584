//! Error types for the replication engine.

use crate::checkpoint::Direction;
use crate::conflict::ConflictHandlerError;
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Errors are cloneable so they can be fanned out on the error stream.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// A store call failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A document kept conflicting after the retry budget was spent.
    #[error("conflict storm on document {id:?} after {attempts} attempts")]
    ConflictStorm {
        /// Primary key of the document.
        id: String,
        /// Resolution attempts made.
        attempts: u32,
    },

    /// A persisted checkpoint could not be decoded.
    #[error("corrupt {direction} checkpoint: {reason}")]
    CheckpointCorruption {
        /// Direction of the checkpoint.
        direction: Direction,
        /// Decoder message.
        reason: String,
    },

    /// The conflict handler failed.
    #[error("conflict handler failed: {0}")]
    ConflictHandler(#[from] ConflictHandlerError),

    /// A write was rejected for a reason other than a conflict.
    #[error("write of document {id:?} rejected: {message}")]
    NonConflictWrite {
        /// Primary key of the document.
        id: String,
        /// Store message.
        message: String,
    },

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

impl ReplicationError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error stops both directions.
    pub fn is_global(&self) -> bool {
        matches!(self, ReplicationError::Storage(StorageError::Closed))
    }

    /// Returns true if this error only affects a single document.
    pub fn is_document_scoped(&self) -> bool {
        matches!(self, ReplicationError::ConflictStorm { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ReplicationError::from(StorageError::unavailable("blip")).is_retryable());
        assert!(!ReplicationError::from(StorageError::Closed).is_retryable());
        assert!(!ReplicationError::Cancelled.is_retryable());
        assert!(!ReplicationError::ConflictStorm {
            id: "a".into(),
            attempts: 3
        }
        .is_retryable());
    }

    #[test]
    fn error_scopes() {
        assert!(ReplicationError::from(StorageError::Closed).is_global());
        assert!(!ReplicationError::from(StorageError::unavailable("x")).is_global());
        let storm = ReplicationError::ConflictStorm {
            id: "a".into(),
            attempts: 3,
        };
        assert!(storm.is_document_scoped());
        assert!(!storm.is_global());
    }

    #[test]
    fn error_display() {
        let err = ReplicationError::CheckpointCorruption {
            direction: Direction::Down,
            reason: "missing field".into(),
        };
        assert_eq!(err.to_string(), "corrupt down checkpoint: missing field");

        let err = ReplicationError::ConflictStorm {
            id: "doc-1".into(),
            attempts: 5,
        };
        assert!(err.to_string().contains("doc-1"));
        assert!(err.to_string().contains('5'));
    }
}
