//! In-memory storage instance.

use crate::context::WriteContext;
use crate::document::{DocState, Document, Revision};
use crate::error::{StorageError, StorageResult};
use crate::instance::{
    BulkWriteError, BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeOperation,
    ChangedDocuments, Checkpoint, EventBulk, StorageInstance, WriteErrorKind,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the change stream; slower subscribers observe `Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct StoredDocument<T> {
    state: DocState<T>,
    sequence: u64,
    deleted_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner<T> {
    documents: HashMap<String, StoredDocument<T>>,
    /// Latest write sequence of each document.
    by_sequence: BTreeMap<u64, String>,
    sequence: u64,
    closed: bool,
    failing_writes: u32,
    failing_reads: u32,
    write_latency: Duration,
    bulk_writes: u64,
}

impl<T> Inner<T> {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn take_read_failure(&mut self) -> StorageResult<()> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(StorageError::unavailable("injected read failure"));
        }
        Ok(())
    }
}

/// An in-memory storage instance.
///
/// This instance keeps all documents in memory and is suitable for:
/// - Unit and integration tests
/// - Ephemeral replicas that don't need persistence
/// - Metadata stores of short-lived replications
///
/// Checkpoints are `{"sequence": n}` objects over a per-instance write
/// sequence. Every successful bulk write emits one [`EventBulk`] on the
/// change stream.
///
/// # Example
///
/// ```rust
/// use docsync_storage::{DocState, InMemoryInstance, WriteContext};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryInstance::new("fork");
/// let written = store
///     .upsert(DocState::new("a", 1u32), WriteContext::local("example"))
///     .await
///     .unwrap();
/// assert_eq!(written.meta.revision.height, 1);
/// assert_eq!(store.get("a").unwrap().data, 1);
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryInstance<T: Document> {
    name: String,
    inner: RwLock<Inner<T>>,
    changes: broadcast::Sender<EventBulk<T>>,
}

impl<T: Document> InMemoryInstance<T> {
    /// Creates a new empty instance.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                documents: HashMap::new(),
                by_sequence: BTreeMap::new(),
                sequence: 0,
                closed: false,
                failing_writes: 0,
                failing_reads: 0,
                write_latency: Duration::ZERO,
                bulk_writes: 0,
            }),
            changes,
        }
    }

    /// Writes `document` on top of whatever is currently stored.
    ///
    /// Convenience for application-side writes in tests and tools.
    pub async fn upsert(
        &self,
        document: DocState<T>,
        context: WriteContext,
    ) -> StorageResult<DocState<T>> {
        let previous = self.get(&document.id);
        let mut response = self
            .bulk_write(
                vec![BulkWriteRow {
                    previous,
                    document,
                }],
                context,
            )
            .await?;
        match response.success.pop() {
            Some(doc) => Ok(doc),
            None => Err(StorageError::unavailable(
                response
                    .error
                    .pop()
                    .map(|e| e.message)
                    .unwrap_or_else(|| "write rejected".into()),
            )),
        }
    }

    /// Returns the stored state of a document, tombstones included.
    pub fn get(&self, id: &str) -> Option<DocState<T>> {
        self.inner.read().documents.get(id).map(|d| d.state.clone())
    }

    /// Returns all stored states sorted by primary key, tombstones included.
    pub fn documents(&self) -> Vec<DocState<T>> {
        let inner = self.inner.read();
        let mut docs: Vec<_> = inner.documents.values().map(|d| d.state.clone()).collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    /// Returns the number of stored documents, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().documents.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many bulk writes were applied.
    pub fn bulk_write_count(&self) -> u64 {
        self.inner.read().bulk_writes
    }

    /// Returns the number of open change-stream receivers.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Makes the next `count` bulk writes fail with a retryable error.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.write().failing_writes = count;
    }

    /// Makes the next `count` reads fail with a retryable error.
    pub fn fail_next_reads(&self, count: u32) {
        self.inner.write().failing_reads = count;
    }

    /// Delays every bulk write by `latency` before it is applied.
    pub fn set_write_latency(&self, latency: Duration) {
        self.inner.write().write_latency = latency;
    }

    /// Extracts the write sequence from a checkpoint produced by this type.
    pub fn checkpoint_sequence(checkpoint: &Checkpoint) -> Option<u64> {
        checkpoint.as_value().get("sequence")?.as_u64()
    }

    fn sequence_checkpoint(sequence: u64) -> Checkpoint {
        Checkpoint::new(serde_json::json!({ "sequence": sequence }))
    }

    fn parse_checkpoint(checkpoint: Option<&Checkpoint>) -> StorageResult<u64> {
        match checkpoint {
            None => Ok(0),
            Some(cp) => Self::checkpoint_sequence(cp)
                .ok_or_else(|| StorageError::InvalidCheckpoint(cp.as_value().to_string())),
        }
    }
}

#[async_trait]
impl<T: Document> StorageInstance<T> for InMemoryInstance<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bulk_write(
        &self,
        rows: Vec<BulkWriteRow<T>>,
        context: WriteContext,
    ) -> StorageResult<BulkWriteResponse<T>> {
        let latency = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;
            if inner.failing_writes > 0 {
                inner.failing_writes -= 1;
                return Err(StorageError::unavailable("injected write failure"));
            }
            inner.write_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.ensure_open()?;
        inner.bulk_writes += 1;

        let mut response = BulkWriteResponse::default();
        let mut events = Vec::new();
        for row in rows {
            let current = inner.documents.get(&row.document.id);
            let matches = match (current, &row.previous) {
                (None, None) => true,
                (Some(cur), Some(prev)) => cur.state.meta.revision == prev.meta.revision,
                _ => false,
            };
            if !matches {
                response.error.push(BulkWriteError {
                    id: row.document.id.clone(),
                    kind: WriteErrorKind::Conflict,
                    message: "previous revision does not match stored revision".into(),
                    document_in_db: current.map(|c| c.state.clone()),
                    write_row: row,
                });
                continue;
            }

            let revision = match Revision::next(
                current.map(|c| &c.state.meta.revision),
                &row.document.data,
                row.document.deleted,
            ) {
                Ok(revision) => revision,
                Err(e) => {
                    response.error.push(BulkWriteError {
                        id: row.document.id.clone(),
                        kind: WriteErrorKind::Other,
                        message: e.to_string(),
                        document_in_db: current.map(|c| c.state.clone()),
                        write_row: row,
                    });
                    continue;
                }
            };
            let previous = current.map(|c| c.state.clone());
            if let Some(old_sequence) = current.map(|c| c.sequence) {
                inner.by_sequence.remove(&old_sequence);
            }
            let mut document = row.document;
            document.meta.revision = revision;
            inner.sequence += 1;
            let sequence = inner.sequence;
            inner.by_sequence.insert(sequence, document.id.clone());

            let operation = match &previous {
                _ if document.deleted => ChangeOperation::Delete,
                Some(prev) if !prev.deleted => ChangeOperation::Update,
                _ => ChangeOperation::Insert,
            };
            inner.documents.insert(
                document.id.clone(),
                StoredDocument {
                    state: document.clone(),
                    sequence,
                    deleted_at: document.deleted.then(Instant::now),
                },
            );
            events.push(ChangeEvent {
                operation,
                id: document.id.clone(),
                document: document.clone(),
                previous,
            });
            response.success.push(document);
        }

        if !events.is_empty() {
            trace!(
                store = %self.name,
                count = events.len(),
                context = %context,
                "committed bulk write"
            );
            // No receivers is fine.
            let _ = self.changes.send(EventBulk {
                events,
                checkpoint: Self::sequence_checkpoint(inner.sequence),
                context,
            });
        }
        Ok(response)
    }

    async fn find_documents_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> StorageResult<HashMap<String, DocState<T>>> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.take_read_failure()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.documents.get(id))
            .filter(|d| include_deleted || !d.state.deleted)
            .map(|d| (d.state.id.clone(), d.state.clone()))
            .collect())
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> StorageResult<ChangedDocuments<T>> {
        let since = Self::parse_checkpoint(checkpoint)?;
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.take_read_failure()?;

        let mut last = None;
        let documents: Vec<_> = inner
            .by_sequence
            .range((Bound::Excluded(since), Bound::Unbounded))
            .take(limit)
            .filter_map(|(seq, id)| {
                last = Some(*seq);
                inner.documents.get(id).map(|d| d.state.clone())
            })
            .collect();
        Ok(ChangedDocuments {
            documents,
            checkpoint: last.map(Self::sequence_checkpoint),
        })
    }

    fn change_stream(&self) -> broadcast::Receiver<EventBulk<T>> {
        self.changes.subscribe()
    }

    async fn cleanup(&self, min_deleted_age: Duration) -> StorageResult<bool> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.ensure_open()?;
        let expired: Vec<(String, u64)> = inner
            .documents
            .values()
            .filter(|d| {
                d.deleted_at
                    .is_some_and(|at| at.elapsed() >= min_deleted_age)
            })
            .map(|d| (d.state.id.clone(), d.sequence))
            .collect();
        for (id, sequence) in expired {
            inner.documents.remove(&id);
            inner.by_sequence.remove(&sequence);
        }
        Ok(true)
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.write().closed = true;
        Ok(())
    }

    async fn remove(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.documents.clear();
        inner.by_sequence.clear();
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WriteContext {
        WriteContext::local("test")
    }

    #[tokio::test]
    async fn memory_new_is_empty() {
        let store: InMemoryInstance<u32> = InMemoryInstance::new("m");
        assert!(store.is_empty());
        let page = store.get_changed_documents_since(10, None).await.unwrap();
        assert!(page.documents.is_empty());
        assert!(page.checkpoint.is_none());
    }

    #[tokio::test]
    async fn memory_insert_assigns_revision() {
        let store = InMemoryInstance::new("m");
        let res = store
            .bulk_write(vec![BulkWriteRow::insert(DocState::new("a", 1u32))], ctx())
            .await
            .unwrap();
        assert_eq!(res.success.len(), 1);
        assert_eq!(res.success[0].meta.revision.height, 1);
        assert_eq!(store.get("a").unwrap().data, 1);
    }

    #[tokio::test]
    async fn memory_stale_previous_conflicts() {
        let store = InMemoryInstance::new("m");
        let first = store.upsert(DocState::new("a", 1u32), ctx()).await.unwrap();
        store
            .upsert(first.clone().updated(2), ctx())
            .await
            .unwrap();

        let res = store
            .bulk_write(
                vec![BulkWriteRow::update(first.clone(), first.updated(3))],
                ctx(),
            )
            .await
            .unwrap();
        assert!(res.success.is_empty());
        assert_eq!(res.error.len(), 1);
        assert!(res.error[0].is_conflict());
        assert_eq!(res.error[0].document_in_db.as_ref().unwrap().data, 2);
    }

    #[tokio::test]
    async fn memory_insert_over_existing_conflicts() {
        let store = InMemoryInstance::new("m");
        store.upsert(DocState::new("a", 1u32), ctx()).await.unwrap();
        let res = store
            .bulk_write(vec![BulkWriteRow::insert(DocState::new("a", 5u32))], ctx())
            .await
            .unwrap();
        assert!(res.error[0].is_conflict());
        assert_eq!(store.get("a").unwrap().data, 1);
    }

    #[tokio::test]
    async fn memory_changes_since_pages_in_order() {
        let store = InMemoryInstance::new("m");
        for i in 0..5u32 {
            store
                .upsert(DocState::new(format!("d{i}"), i), ctx())
                .await
                .unwrap();
        }
        let page = store.get_changed_documents_since(3, None).await.unwrap();
        let ids: Vec<_> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
        let cp = page.checkpoint.unwrap();
        assert_eq!(InMemoryInstance::<u32>::checkpoint_sequence(&cp), Some(3));

        let rest = store
            .get_changed_documents_since(3, Some(&cp))
            .await
            .unwrap();
        assert_eq!(rest.documents.len(), 2);
    }

    #[tokio::test]
    async fn memory_rewritten_document_moves_to_end() {
        let store = InMemoryInstance::new("m");
        let a = store.upsert(DocState::new("a", 1u32), ctx()).await.unwrap();
        store.upsert(DocState::new("b", 1u32), ctx()).await.unwrap();
        store.upsert(a.updated(2), ctx()).await.unwrap();

        let page = store.get_changed_documents_since(10, None).await.unwrap();
        let ids: Vec<_> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(page.documents[1].data, 2);
    }

    #[tokio::test]
    async fn memory_invalid_checkpoint() {
        let store: InMemoryInstance<u32> = InMemoryInstance::new("m");
        let bad = Checkpoint::new(serde_json::json!("nope"));
        let err = store
            .get_changed_documents_since(1, Some(&bad))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidCheckpoint(_)));
    }

    #[tokio::test]
    async fn memory_change_stream_carries_context() {
        let store = InMemoryInstance::new("m");
        let mut rx = store.change_stream();
        store
            .upsert(DocState::new("a", 1u32), WriteContext::local("app"))
            .await
            .unwrap();
        let bulk = rx.recv().await.unwrap();
        assert_eq!(bulk.events.len(), 1);
        assert_eq!(bulk.events[0].operation, ChangeOperation::Insert);
        assert_eq!(bulk.context.label, "app");
        assert_eq!(
            InMemoryInstance::<u32>::checkpoint_sequence(&bulk.checkpoint),
            Some(1)
        );
    }

    #[tokio::test]
    async fn memory_find_hides_tombstones_unless_asked() {
        let store = InMemoryInstance::new("m");
        let a = store.upsert(DocState::new("a", 1u32), ctx()).await.unwrap();
        store.upsert(a.tombstone(), ctx()).await.unwrap();

        let ids = vec!["a".to_string()];
        assert!(store.find_documents_by_id(&ids, false).await.unwrap().is_empty());
        let found = store.find_documents_by_id(&ids, true).await.unwrap();
        assert!(found["a"].deleted);
    }

    #[tokio::test]
    async fn memory_cleanup_purges_tombstones() {
        let store = InMemoryInstance::new("m");
        let a = store.upsert(DocState::new("a", 1u32), ctx()).await.unwrap();
        store.upsert(a.tombstone(), ctx()).await.unwrap();
        store.upsert(DocState::new("b", 2u32), ctx()).await.unwrap();

        assert!(store.cleanup(Duration::ZERO).await.unwrap());
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        let page = store.get_changed_documents_since(10, None).await.unwrap();
        assert_eq!(page.documents.len(), 1);
    }

    #[tokio::test]
    async fn memory_unencodable_row_is_rejected_alone() {
        let store = InMemoryInstance::new("m");
        // Byte-string keys have no JSON encoding; an empty map does.
        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], 1u32);
        let good: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
        let res = store
            .bulk_write(
                vec![
                    BulkWriteRow::insert(DocState::new("bad", bad)),
                    BulkWriteRow::insert(DocState::new("good", good)),
                ],
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(res.success.len(), 1);
        assert_eq!(res.success[0].id, "good");
        assert_eq!(res.error[0].kind, WriteErrorKind::Other);
        assert!(store.get("bad").is_none());
    }

    #[tokio::test]
    async fn memory_injected_failures_are_retryable() {
        let store = InMemoryInstance::new("m");
        store.fail_next_writes(1);
        let err = store
            .upsert(DocState::new("a", 1u32), ctx())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        store.upsert(DocState::new("a", 1u32), ctx()).await.unwrap();

        store.fail_next_reads(1);
        assert!(store.get_changed_documents_since(1, None).await.is_err());
        assert!(store.get_changed_documents_since(1, None).await.is_ok());
    }

    #[tokio::test]
    async fn memory_closed_rejects_calls() {
        let store: InMemoryInstance<u32> = InMemoryInstance::new("m");
        store.close().await.unwrap();
        let err = store.get_changed_documents_since(1, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }

    #[tokio::test]
    async fn memory_remove_clears_and_closes() {
        let store = InMemoryInstance::new("m");
        store.upsert(DocState::new("a", 1u32), ctx()).await.unwrap();
        store.remove().await.unwrap();
        assert!(store.is_empty());
        assert!(store
            .upsert(DocState::new("b", 1u32), ctx())
            .await
            .is_err());
    }
}
