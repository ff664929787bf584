//! Assumed master states.
//!
//! For every document it has synchronized, a replication remembers the master
//! state it last saw. The pusher uses it as the expected previous state when
//! writing to master; the puller uses it to detect pending local edits.

use crate::checkpoint::Direction;
use crate::error::ReplicationResult;
use crate::guard;
use crate::state::Shared;
use docsync_storage::{BulkWriteRow, DocState, Document, StorageError};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Returns the meta document id holding the assumed master state of `doc_id`.
pub fn assumed_master_document_id(identifier: &str, doc_id: &str) -> String {
    format!("{identifier}|assumed|{doc_id}")
}

/// An assumed master state with the meta document storing it.
#[derive(Debug, Clone)]
pub(crate) struct AssumedMaster<T> {
    pub(crate) state: DocState<T>,
    pub(crate) meta_document: DocState<serde_json::Value>,
}

/// Loads the assumed master states of `ids`; missing ones are absent.
pub(crate) async fn get_assumed_master_states<T: Document>(
    shared: &Shared<T>,
    ids: &[String],
) -> ReplicationResult<HashMap<String, AssumedMaster<T>>> {
    let meta_ids: Vec<String> = ids
        .iter()
        .map(|id| assumed_master_document_id(shared.identifier(), id))
        .collect();
    let meta_ids = &meta_ids[..];
    let meta = &shared.meta;
    let found = shared
        .with_retry("read assumed master states", move || {
            meta.find_documents_by_id(meta_ids, false)
        })
        .await?;

    let mut states = HashMap::with_capacity(found.len());
    for meta_document in found.into_values() {
        match serde_json::from_value::<DocState<T>>(meta_document.data.clone()) {
            Ok(state) => {
                states.insert(
                    state.id.clone(),
                    AssumedMaster {
                        state,
                        meta_document,
                    },
                );
            }
            Err(e) => warn!(
                replication = %shared.identifier(),
                meta_id = %meta_document.id,
                error = %e,
                "ignoring unreadable assumed master state"
            ),
        }
    }
    Ok(states)
}

/// Builds the meta write recording `master_state` as assumed.
pub(crate) fn assumed_master_row<T: Document>(
    shared: &Shared<T>,
    master_state: &DocState<T>,
    previous: Option<&AssumedMaster<T>>,
) -> ReplicationResult<BulkWriteRow<serde_json::Value>> {
    let data = serde_json::to_value(master_state).map_err(StorageError::from)?;
    Ok(BulkWriteRow {
        previous: previous.map(|p| p.meta_document.clone()),
        document: DocState::new(
            assumed_master_document_id(shared.identifier(), &master_state.id),
            data,
        ),
    })
}

/// Writes assumed master states.
///
/// Conflicts mean the other direction recorded a state concurrently; its
/// value is kept.
pub(crate) async fn write_assumed_master_states<T: Document>(
    shared: &Shared<T>,
    direction: Direction,
    rows: Vec<BulkWriteRow<serde_json::Value>>,
) -> ReplicationResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let context = guard::meta_context(shared.identifier(), direction);
    let meta = &shared.meta;
    let rows = &rows;
    let context = &context;
    let response = shared
        .with_retry("write assumed master states", move || {
            meta.bulk_write(rows.clone(), context.clone())
        })
        .await?;
    for err in response.error {
        if err.is_conflict() {
            debug!(
                replication = %shared.identifier(),
                %direction,
                meta_id = %err.id,
                "assumed master state changed concurrently"
            );
        } else {
            warn!(
                replication = %shared.identifier(),
                %direction,
                meta_id = %err.id,
                message = %err.message,
                "failed to record assumed master state"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::state::ReplicationInput;
    use docsync_storage::{InMemoryInstance, WriteContext};
    use std::sync::Arc;

    fn shared(meta: Arc<InMemoryInstance<serde_json::Value>>) -> Shared<u32> {
        Shared::new(ReplicationInput::new(
            ReplicationConfig::new("users"),
            Arc::new(InMemoryInstance::<u32>::new("fork")),
            Arc::new(InMemoryInstance::<u32>::new("master")),
            meta,
        ))
    }

    #[test]
    fn document_id() {
        assert_eq!(assumed_master_document_id("users", "alice"), "users|assumed|alice");
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let meta = Arc::new(InMemoryInstance::new("meta"));
        let shared = shared(Arc::clone(&meta));
        let alice = DocState::new("alice", 30u32).with_lwt(7);

        let row = assumed_master_row(&shared, &alice, None).unwrap();
        write_assumed_master_states(&shared, Direction::Down, vec![row])
            .await
            .unwrap();

        let ids = vec!["alice".to_string(), "bob".to_string()];
        let states = get_assumed_master_states(&shared, &ids).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states["alice"].state, alice);
    }

    #[tokio::test]
    async fn overwrite_uses_previous_meta_document() {
        let meta = Arc::new(InMemoryInstance::new("meta"));
        let shared = shared(Arc::clone(&meta));
        let ids = vec!["alice".to_string()];

        let first = DocState::new("alice", 1u32);
        let row = assumed_master_row(&shared, &first, None).unwrap();
        write_assumed_master_states(&shared, Direction::Up, vec![row])
            .await
            .unwrap();

        let stored = get_assumed_master_states(&shared, &ids).await.unwrap();
        let second = DocState::new("alice", 2u32);
        let row = assumed_master_row(&shared, &second, stored.get("alice")).unwrap();
        write_assumed_master_states(&shared, Direction::Up, vec![row])
            .await
            .unwrap();

        let stored = get_assumed_master_states(&shared, &ids).await.unwrap();
        assert_eq!(stored["alice"].state.data, 2);
    }

    #[tokio::test]
    async fn stale_write_keeps_stored_state() {
        let meta = Arc::new(InMemoryInstance::new("meta"));
        let shared = shared(Arc::clone(&meta));
        let ids = vec!["alice".to_string()];

        let row = assumed_master_row(&shared, &DocState::new("alice", 1u32), None).unwrap();
        write_assumed_master_states(&shared, Direction::Up, vec![row])
            .await
            .unwrap();
        // An insert on top of an existing document conflicts and is ignored.
        let row = assumed_master_row(&shared, &DocState::new("alice", 2u32), None).unwrap();
        write_assumed_master_states(&shared, Direction::Down, vec![row])
            .await
            .unwrap();

        let stored = get_assumed_master_states(&shared, &ids).await.unwrap();
        assert_eq!(stored["alice"].state.data, 1);
    }

    #[tokio::test]
    async fn unreadable_state_is_absent() {
        let meta = Arc::new(InMemoryInstance::new("meta"));
        meta.upsert(
            DocState::new(
                assumed_master_document_id("users", "alice"),
                serde_json::json!({"not": "a state"}),
            ),
            WriteContext::local("test"),
        )
        .await
        .unwrap();
        let shared = shared(meta);
        let states = get_assumed_master_states(&shared, &["alice".to_string()])
            .await
            .unwrap();
        assert!(states.is_empty());
    }
}
