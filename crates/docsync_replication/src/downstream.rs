//! Master to fork replication.
//!
//! The puller drains master's change history from its checkpoint in pages of
//! `pull_batch_size` and applies each page to the fork. In live mode master
//! change events only wake the puller up; the documents themselves are always
//! re-read through the paged history so the checkpoint stays authoritative.

use crate::checkpoint::{self, Direction};
use crate::error::{ReplicationError, ReplicationResult};
use crate::guard;
use crate::leader;
use crate::meta;
use crate::state::{LoopPhase, Shared};
use docsync_storage::{BulkWriteRow, DocState, Document, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, instrument, trace};

/// Runs the downstream loop until cancellation or a fatal error.
#[instrument(skip_all, fields(replication = %shared.identifier(), direction = "down"))]
pub(crate) async fn run<T: Document>(shared: Arc<Shared<T>>) {
    if leader::wait_for_leadership(&shared).await {
        if let Err(e) = run_inner(&shared).await {
            if !matches!(e, ReplicationError::Cancelled) {
                shared.report(Direction::Down, e);
            }
        }
    }
    shared.stop(Direction::Down);
    debug!("downstream stopped");
}

async fn run_inner<T: Document>(shared: &Shared<T>) -> ReplicationResult<()> {
    // Subscribe before the initial drain so no change falls in between.
    let mut changes = shared.config.live.then(|| shared.master.change_stream());

    drain(shared).await?;
    shared.mark_first_sync_done(Direction::Down);
    shared.set_phase(Direction::Down, LoopPhase::Idle);

    let Some(changes) = changes.as_mut() else {
        return Ok(());
    };
    loop {
        let woke = tokio::select! {
            _ = shared.wait_canceled() => return Ok(()),
            received = changes.recv() => received,
        };
        match woke {
            Ok(bulk) => {
                trace!(count = bulk.events.len(), "master changed");
                shared.stats.write().down.master_change_stream_emit += 1;
            }
            Err(RecvError::Lagged(missed)) => {
                debug!(missed, "master change stream lagged, resyncing");
            }
            Err(RecvError::Closed) => {
                info!("master change stream closed");
                return Ok(());
            }
        }
        shared.set_phase(Direction::Down, LoopPhase::Fetching);
        // One drain covers every wake-up already queued.
        loop {
            match changes.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => break,
            }
        }
        drain(shared).await?;
        shared.set_phase(Direction::Down, LoopPhase::Idle);
    }
}

/// Applies master's history from the stored checkpoint until caught up.
async fn drain<T: Document>(shared: &Shared<T>) -> ReplicationResult<()> {
    shared.stats.write().down.cycles += 1;
    let batch_size = shared.config.pull_batch_size;
    let mut checkpoint = checkpoint::get_last_checkpoint(shared, Direction::Down).await?;
    loop {
        shared.check_cancelled()?;
        shared.set_phase(Direction::Down, LoopPhase::Fetching);
        let master = &shared.master;
        let since = checkpoint.as_ref();
        let fetched = shared
            .with_retry("read master changes", move || {
                master.get_changed_documents_since(batch_size, since)
            })
            .await;
        let page = match fetched {
            Ok(page) => page,
            Err(ReplicationError::Storage(StorageError::InvalidCheckpoint(reason)))
                if checkpoint.is_some() =>
            {
                checkpoint::discard_rejected(shared, Direction::Down, reason);
                checkpoint = None;
                continue;
            }
            Err(e) => return Err(e),
        };
        shared.stats.write().down.fetches += 1;

        let count = page.documents.len();
        if count == 0 {
            return Ok(());
        }
        debug!(count, "applying master page");
        shared.set_phase(Direction::Down, LoopPhase::Applying);
        apply_page(shared, page.documents).await?;

        // Never advance past work a canceled run may not have finished.
        shared.check_cancelled()?;
        if let Some(next) = page.checkpoint {
            checkpoint::set_checkpoint(shared, Direction::Down, &next).await?;
            checkpoint = Some(next);
        }
        if count < batch_size {
            return Ok(());
        }
    }
}

async fn apply_page<T: Document>(
    shared: &Shared<T>,
    master_states: Vec<DocState<T>>,
) -> ReplicationResult<()> {
    let handler = &shared.conflict_handler;
    let ids: Vec<String> = master_states.iter().map(|d| d.id.clone()).collect();
    let fork = &shared.fork;
    let id_slice = &ids[..];
    let fork_states = shared
        .with_retry("read fork documents", move || {
            fork.find_documents_by_id(id_slice, true)
        })
        .await?;
    let assumed = meta::get_assumed_master_states(shared, &ids).await?;

    let mut fork_rows = Vec::new();
    let mut pending_meta: HashMap<String, BulkWriteRow<serde_json::Value>> = HashMap::new();
    let mut meta_rows = Vec::new();
    let mut skipped_pending = 0u64;
    let mut skipped_equal = 0u64;

    for master_state in master_states {
        let id = master_state.id.clone();
        let fork_state = fork_states.get(&id);
        let assumed_master = assumed.get(&id);

        // A fork state that differs from what master last had is a local
        // edit; the pusher owns it.
        let has_pending_edit = match (fork_state, assumed_master) {
            (Some(_), None) => true,
            (Some(fork_state), Some(assumed_master)) => !handler.is_equal(
                &assumed_master.state,
                fork_state,
                "downstream-check-if-equal-0",
            )?,
            (None, _) => false,
        };
        if has_pending_edit {
            trace!(%id, "skipping document with pending local edit");
            skipped_pending += 1;
            continue;
        }

        if let Some(fork_state) = fork_state {
            if handler.is_equal(&master_state, fork_state, "downstream-check-if-equal-1")? {
                let known = assumed_master
                    .is_some_and(|a| a.state.meta.revision == master_state.meta.revision);
                if !known {
                    meta_rows.push(meta::assumed_master_row(shared, &master_state, assumed_master)?);
                }
                skipped_equal += 1;
                continue;
            }
        }

        pending_meta.insert(
            id,
            meta::assumed_master_row(shared, &master_state, assumed_master)?,
        );
        fork_rows.push(BulkWriteRow {
            previous: fork_state.cloned(),
            document: master_state,
        });
    }

    let mut applied = 0u64;
    let mut dropped = 0u64;
    let mut written_states = Vec::new();
    if !fork_rows.is_empty() {
        let context = guard::downstream_context(shared.identifier());
        let rows = &fork_rows;
        let context = &context;
        let applying = shared.unconfirmed.begin_apply().await;
        let response = shared
            .with_retry("write fork documents", move || {
                fork.bulk_write(rows.clone(), context.clone())
            })
            .await?;
        shared.unconfirmed.record(&response.success);
        drop(applying);
        for written in &response.success {
            if let Some(row) = pending_meta.remove(&written.id) {
                meta_rows.push(row);
            }
            applied += 1;
        }
        for err in response.error {
            if !err.is_conflict() {
                return Err(ReplicationError::NonConflictWrite {
                    id: err.id,
                    message: err.message,
                });
            }
            // The fork changed under us; the pusher will reconcile it.
            debug!(id = %err.id, "fork changed during apply, dropping master state");
            dropped += 1;
        }
        written_states = response.success;
    }

    meta::write_assumed_master_states(shared, Direction::Down, meta_rows).await?;
    shared.unconfirmed.confirm(&written_states);

    let mut stats = shared.stats.write();
    stats.down.pages_applied += 1;
    stats.down.documents_applied += applied;
    stats.down.dropped_conflicts += dropped;
    stats.down.skipped_pending_local += skipped_pending;
    stats.down.skipped_equal += skipped_equal;
    Ok(())
}
