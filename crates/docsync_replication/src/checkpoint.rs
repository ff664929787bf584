//! Checkpoint persistence in the meta store.
//!
//! Each direction keeps one meta document holding the last checkpoint it
//! fully processed. Writes use optimistic concurrency against the last
//! document this replication wrote and retry once after reloading.

use crate::error::{ReplicationError, ReplicationResult};
use crate::guard;
use crate::state::Shared;
use docsync_storage::{BulkWriteRow, Checkpoint, DocState, Document, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Fork to master.
    Up,
    /// Master to fork.
    Down,
}

impl Direction {
    /// Returns the short name used in meta document ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the meta document id of a checkpoint.
pub fn checkpoint_document_id(identifier: &str, direction: Direction) -> String {
    format!("{identifier}|checkpoint|{direction}")
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    replication: String,
    direction: String,
    checkpoint: Checkpoint,
}

struct StoredCheckpoint {
    checkpoint: Option<Checkpoint>,
    document: Option<DocState<serde_json::Value>>,
}

async fn load<T: Document>(
    shared: &Shared<T>,
    direction: Direction,
) -> ReplicationResult<StoredCheckpoint> {
    let id = checkpoint_document_id(shared.identifier(), direction);
    let ids = [id.clone()];
    let ids = &ids[..];
    let meta = &shared.meta;
    let mut found = shared
        .with_retry("read checkpoint", move || meta.find_documents_by_id(ids, false))
        .await?;
    let Some(document) = found.remove(&id) else {
        return Ok(StoredCheckpoint {
            checkpoint: None,
            document: None,
        });
    };

    let decoded = serde_json::from_value::<CheckpointDocument>(document.data.clone())
        .map_err(|e| e.to_string())
        .and_then(|doc| {
            if doc.direction == direction.as_str() {
                Ok(doc.checkpoint)
            } else {
                Err(format!("stored for direction {:?}", doc.direction))
            }
        });
    match decoded {
        Ok(checkpoint) => Ok(StoredCheckpoint {
            checkpoint: Some(checkpoint),
            document: Some(document),
        }),
        Err(reason) => {
            warn!(
                replication = %shared.identifier(),
                %direction,
                %reason,
                "ignoring unreadable checkpoint, starting from scratch"
            );
            shared.report(
                direction,
                ReplicationError::CheckpointCorruption { direction, reason },
            );
            Ok(StoredCheckpoint {
                checkpoint: None,
                document: Some(document),
            })
        }
    }
}

/// Reads the last checkpoint of `direction`.
///
/// A missing or undecodable document reads as `None`; corruption is also
/// published on the error stream.
pub(crate) async fn get_last_checkpoint<T: Document>(
    shared: &Shared<T>,
    direction: Direction,
) -> ReplicationResult<Option<Checkpoint>> {
    let stored = load(shared, direction).await?;
    *shared.checkpoint_docs.get(direction).lock() = stored.document;
    Ok(stored.checkpoint)
}

/// Reports a stored checkpoint the store refused to read from.
///
/// The caller continues from `None`; the next saved checkpoint replaces the
/// stored one.
pub(crate) fn discard_rejected<T: Document>(
    shared: &Shared<T>,
    direction: Direction,
    reason: String,
) {
    warn!(
        replication = %shared.identifier(),
        %direction,
        %reason,
        "store rejected checkpoint, starting from scratch"
    );
    shared.report(
        direction,
        ReplicationError::CheckpointCorruption { direction, reason },
    );
}

/// Persists `checkpoint` for `direction`.
///
/// Does nothing once the replication is canceled.
pub(crate) async fn set_checkpoint<T: Document>(
    shared: &Shared<T>,
    direction: Direction,
    checkpoint: &Checkpoint,
) -> ReplicationResult<()> {
    if shared.is_canceled() {
        return Ok(());
    }
    let data = serde_json::to_value(CheckpointDocument {
        replication: shared.identifier().to_string(),
        direction: direction.as_str().to_string(),
        checkpoint: checkpoint.clone(),
    })
    .map_err(StorageError::from)?;
    let id = checkpoint_document_id(shared.identifier(), direction);
    let context = guard::meta_context(shared.identifier(), direction);

    let mut previous = shared.checkpoint_docs.get(direction).lock().clone();
    for attempt in 0..2 {
        let row = BulkWriteRow {
            previous: previous.clone(),
            document: DocState::new(id.clone(), data.clone()),
        };
        let meta = &shared.meta;
        let context = &context;
        let response = shared
            .with_retry("write checkpoint", move || {
                meta.bulk_write(vec![row.clone()], context.clone())
            })
            .await?;

        if let Some(written) = response.success.into_iter().next() {
            *shared.checkpoint_docs.get(direction).lock() = Some(written);
            let mut stats = shared.stats.write();
            match direction {
                Direction::Up => stats.up.checkpoint_advances += 1,
                Direction::Down => stats.down.checkpoint_advances += 1,
            }
            debug!(
                replication = %shared.identifier(),
                %direction,
                checkpoint = %checkpoint.as_value(),
                "checkpoint saved"
            );
            return Ok(());
        }

        match response.error.into_iter().next() {
            Some(err) if err.is_conflict() && attempt == 0 => {
                debug!(
                    replication = %shared.identifier(),
                    %direction,
                    "checkpoint document moved, reloading"
                );
                previous = err.document_in_db;
            }
            Some(err) => {
                return Err(ReplicationError::NonConflictWrite {
                    id,
                    message: err.message,
                })
            }
            None => break,
        }
    }
    Err(ReplicationError::NonConflictWrite {
        id,
        message: "checkpoint document kept changing".to_string(),
    })
}
