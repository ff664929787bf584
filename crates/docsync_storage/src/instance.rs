//! Storage instance trait definition.

use crate::context::WriteContext;
use crate::document::{DocState, Document};
use crate::error::StorageResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// An opaque, store-defined position in a change history.
///
/// Everything up to the checkpoint has been seen by whoever holds it. Only the
/// store that produced a checkpoint can interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub serde_json::Value);

impl Checkpoint {
    /// Wraps a raw value.
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A single row of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteRow<T> {
    /// The state the writer believes is current; `None` for inserts.
    pub previous: Option<DocState<T>>,
    /// The state to store.
    pub document: DocState<T>,
}

impl<T> BulkWriteRow<T> {
    /// Creates an insert row.
    pub fn insert(document: DocState<T>) -> Self {
        Self {
            previous: None,
            document,
        }
    }

    /// Creates an update row on top of `previous`.
    pub fn update(previous: DocState<T>, document: DocState<T>) -> Self {
        Self {
            previous: Some(previous),
            document,
        }
    }
}

/// Why a row of a bulk write was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// The stored revision differs from `previous` (HTTP 409 analogue).
    Conflict,
    /// Any other per-row failure.
    Other,
}

/// A rejected row of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteError<T> {
    /// Primary key of the rejected document.
    pub id: String,
    /// Discriminator.
    pub kind: WriteErrorKind,
    /// Human-readable reason.
    pub message: String,
    /// The current stored state, when available.
    pub document_in_db: Option<DocState<T>>,
    /// The row that was rejected.
    pub write_row: BulkWriteRow<T>,
}

impl<T> BulkWriteError<T> {
    /// Returns true if this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        self.kind == WriteErrorKind::Conflict
    }
}

/// Result of a bulk write: per-row successes and errors.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteResponse<T> {
    /// Stored states, with store-assigned revisions.
    pub success: Vec<DocState<T>>,
    /// Rejected rows.
    pub error: Vec<BulkWriteError<T>>,
}

impl<T> Default for BulkWriteResponse<T> {
    fn default() -> Self {
        Self {
            success: Vec::new(),
            error: Vec::new(),
        }
    }
}

/// Kind of change recorded in a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    /// No live previous state existed.
    Insert,
    /// A live previous state was replaced.
    Update,
    /// The document became a tombstone.
    Delete,
}

/// A single committed change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    /// Operation kind.
    pub operation: ChangeOperation,
    /// Primary key.
    pub id: String,
    /// State after the write.
    pub document: DocState<T>,
    /// State before the write, if any.
    pub previous: Option<DocState<T>>,
}

/// All changes committed by one bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBulk<T> {
    /// Committed changes, in write order.
    pub events: Vec<ChangeEvent<T>>,
    /// Position after the last change of this bulk.
    pub checkpoint: Checkpoint,
    /// The context the write was made with.
    pub context: WriteContext,
}

/// A page of changed documents.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedDocuments<T> {
    /// Latest state of each changed document, in change order.
    pub documents: Vec<DocState<T>>,
    /// Position after the last returned document; `None` if nothing changed.
    pub checkpoint: Option<Checkpoint>,
}

/// A document store that can take part in a replication.
///
/// Implementations must provide per-document optimistic concurrency: a row
/// whose `previous` revision does not match the stored revision is rejected
/// with [`WriteErrorKind::Conflict`] and the stored state attached.
///
/// # Implementors
///
/// - [`crate::InMemoryInstance`] - For testing and ephemeral replicas
#[async_trait]
pub trait StorageInstance<T: Document>: Send + Sync {
    /// Returns a name for logs.
    fn name(&self) -> &str;

    /// Writes rows, checking each `previous` against the stored revision.
    ///
    /// # Errors
    ///
    /// Returns an error only if the call as a whole failed; per-row
    /// failures are reported in the response.
    async fn bulk_write(
        &self,
        rows: Vec<BulkWriteRow<T>>,
        context: WriteContext,
    ) -> StorageResult<BulkWriteResponse<T>>;

    /// Looks up documents by primary key.
    ///
    /// Tombstones are returned only when `include_deleted` is set.
    async fn find_documents_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> StorageResult<HashMap<String, DocState<T>>>;

    /// Returns up to `limit` documents changed after `checkpoint`.
    ///
    /// A `None` checkpoint starts from the beginning of the history.
    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> StorageResult<ChangedDocuments<T>>;

    /// Subscribes to committed writes.
    fn change_stream(&self) -> broadcast::Receiver<EventBulk<T>>;

    /// Purges tombstones older than `min_deleted_age`.
    ///
    /// Returns true when no purgeable tombstones remain.
    async fn cleanup(&self, min_deleted_age: Duration) -> StorageResult<bool>;

    /// Closes the instance; further calls fail with `Closed`.
    async fn close(&self) -> StorageResult<()>;

    /// Deletes all data and closes the instance.
    async fn remove(&self) -> StorageResult<()>;
}
