//! Fork to master replication.
//!
//! The pusher walks the fork's change history from its checkpoint and writes
//! every state master has not seen yet, using the assumed master state as the
//! expected previous revision. Master rejects stale pushes with a conflict,
//! which is resolved here and written back to both peers.

use crate::checkpoint::{self, Direction};
use crate::conflict::{resolve_conflict, ConflictResolution, ResolvedConflict};
use crate::error::{ReplicationError, ReplicationResult};
use crate::guard;
use crate::leader;
use crate::meta::{self, AssumedMaster};
use crate::state::{LoopPhase, Shared};
use docsync_storage::{BulkWriteRow, DocState, Document, EventBulk, StorageError};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Runs the upstream loop until cancellation or a fatal error.
#[instrument(skip_all, fields(replication = %shared.identifier(), direction = "up"))]
pub(crate) async fn run<T: Document>(shared: Arc<Shared<T>>) {
    if leader::wait_for_leadership(&shared).await {
        if let Err(e) = run_inner(&shared).await {
            if !matches!(e, ReplicationError::Cancelled) {
                shared.report(Direction::Up, e);
            }
        }
    }
    shared.stop(Direction::Up);
    debug!("upstream stopped");
}

async fn run_inner<T: Document>(shared: &Shared<T>) -> ReplicationResult<()> {
    let mut changes = shared.config.live.then(|| shared.fork.change_stream());

    initial_sync(shared).await?;
    shared.mark_first_sync_done(Direction::Up);
    shared.set_phase(Direction::Up, LoopPhase::Watching);

    let Some(changes) = changes.as_mut() else {
        return Ok(());
    };
    loop {
        let Some(mut pending) = next_local_change(shared, changes).await else {
            return Ok(());
        };
        shared.set_phase(Direction::Up, LoopPhase::Collecting);

        let deadline = Instant::now() + shared.config.push_debounce;
        while pending < shared.config.push_batch_size {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                next = next_local_change(shared, changes) => match next {
                    Some(count) => pending = pending.saturating_add(count),
                    None => return Ok(()),
                },
            }
        }

        trace!(pending, "pushing collected fork changes");
        push_pending(shared).await?;
        shared.set_phase(Direction::Up, LoopPhase::Watching);
    }
}

/// Waits for the next change bulk this replication did not write itself.
///
/// Returns the number of changed documents, or `None` once canceled or the
/// stream is closed. A lagged stream counts as a full batch.
async fn next_local_change<T: Document>(
    shared: &Shared<T>,
    changes: &mut broadcast::Receiver<EventBulk<T>>,
) -> Option<usize> {
    loop {
        let received = tokio::select! {
            _ = shared.wait_canceled() => return None,
            received = changes.recv() => received,
        };
        match received {
            Ok(bulk) if guard::is_own_fork_write(shared.identifier(), &bulk.context) => {
                trace!(context = %bulk.context, "ignoring own fork write");
                shared.stats.write().up.ignored_own_writes += 1;
            }
            Ok(bulk) => {
                shared.stats.write().up.fork_change_stream_emit += 1;
                return Some(bulk.events.len());
            }
            Err(RecvError::Lagged(missed)) => {
                debug!(missed, "fork change stream lagged, resyncing");
                return Some(shared.config.push_batch_size);
            }
            Err(RecvError::Closed) => {
                info!("fork change stream closed");
                return None;
            }
        }
    }
}

/// Pushes the fork backlog, repeating while conflict winners were written.
async fn initial_sync<T: Document>(shared: &Shared<T>) -> ReplicationResult<()> {
    while push_pending(shared).await? {
        debug!("conflict winners written, re-running initial sync");
    }
    Ok(())
}

/// Pushes fork changes since the stored checkpoint.
///
/// Returns true if any conflict winner was written.
async fn push_pending<T: Document>(shared: &Shared<T>) -> ReplicationResult<bool> {
    shared.stats.write().up.cycles += 1;
    let batch_size = shared.config.push_batch_size;
    let mut checkpoint = checkpoint::get_last_checkpoint(shared, Direction::Up).await?;
    let mut wrote_winners = false;
    loop {
        shared.check_cancelled()?;
        shared.set_phase(Direction::Up, LoopPhase::Pushing);
        let fork = &shared.fork;
        let since = checkpoint.as_ref();
        let fetched = shared
            .with_retry("read fork changes", move || {
                fork.get_changed_documents_since(batch_size, since)
            })
            .await;
        let page = match fetched {
            Ok(page) => page,
            Err(ReplicationError::Storage(StorageError::InvalidCheckpoint(reason)))
                if checkpoint.is_some() =>
            {
                checkpoint::discard_rejected(shared, Direction::Up, reason);
                checkpoint = None;
                continue;
            }
            Err(e) => return Err(e),
        };
        shared.stats.write().up.fetches += 1;

        let count = page.documents.len();
        if count == 0 {
            return Ok(wrote_winners);
        }
        debug!(count, "pushing fork page");
        wrote_winners |= persist_to_master(shared, page.documents).await?;

        shared.check_cancelled()?;
        if let Some(next) = page.checkpoint {
            checkpoint::set_checkpoint(shared, Direction::Up, &next).await?;
            checkpoint = Some(next);
        }
        if count < batch_size {
            return Ok(wrote_winners);
        }
    }
}

/// Writes fork states to master and resolves the conflicts it reports.
async fn persist_to_master<T: Document>(
    shared: &Shared<T>,
    fork_states: Vec<DocState<T>>,
) -> ReplicationResult<bool> {
    let handler = &shared.conflict_handler;
    // Must run before the assumed states are read: once a pulled state
    // leaves the registry its assumed master state is already stored.
    let (fork_states, pulled) = shared.unconfirmed.split_local(fork_states).await;
    if !pulled.is_empty() {
        trace!(count = pulled.len(), "skipping states the puller just wrote");
        shared.stats.write().up.skipped_own_writes += pulled.len() as u64;
    }
    let ids: Vec<String> = fork_states.iter().map(|d| d.id.clone()).collect();
    let assumed = meta::get_assumed_master_states(shared, &ids).await?;

    shared.stats.write().up.pages_pushed += 1;
    let mut rows = Vec::with_capacity(fork_states.len());
    let mut skipped = 0u64;
    for fork_state in fork_states {
        let assumed_master = assumed.get(&fork_state.id);
        if let Some(assumed_master) = assumed_master {
            // Master already has this state, typically one we pulled.
            if handler.is_equal(&assumed_master.state, &fork_state, "upstream-check-if-equal")? {
                skipped += 1;
                continue;
            }
        }
        rows.push(BulkWriteRow {
            previous: assumed_master.map(|a| a.state.clone()),
            document: fork_state,
        });
    }
    shared.stats.write().up.skipped_equal += skipped;
    if rows.is_empty() {
        return Ok(false);
    }

    let context = guard::upstream_context(shared.identifier());
    let master = &shared.master;
    let rows = &rows;
    let context = &context;
    let response = shared
        .with_retry("write master documents", move || {
            master.bulk_write(rows.clone(), context.clone())
        })
        .await?;

    let mut meta_rows = Vec::with_capacity(response.success.len());
    for written in &response.success {
        meta_rows.push(meta::assumed_master_row(
            shared,
            written,
            assumed.get(&written.id),
        )?);
    }
    meta::write_assumed_master_states(shared, Direction::Up, meta_rows).await?;
    shared.stats.write().up.documents_pushed += response.success.len() as u64;

    let mut wrote_winners = false;
    if !response.error.is_empty() {
        shared.set_phase(Direction::Up, LoopPhase::Resolving);
    }
    for err in response.error {
        if !err.is_conflict() {
            return Err(ReplicationError::NonConflictWrite {
                id: err.id,
                message: err.message,
            });
        }
        shared.stats.write().up.conflicts += 1;
        let pushed = err.write_row.document;
        match resolve_and_write(shared, pushed, assumed.get(&err.id)).await {
            Ok(wrote) => wrote_winners |= wrote,
            Err(e) if e.is_document_scoped() => {
                shared.stats.write().up.conflict_storms += 1;
                shared.report(Direction::Up, e);
            }
            Err(e) => return Err(e),
        }
    }
    shared.set_phase(Direction::Up, LoopPhase::Pushing);
    Ok(wrote_winners)
}

/// Resolves one conflicting push, retrying against a moving master.
///
/// Returns true if a winner was written.
async fn resolve_and_write<T: Document>(
    shared: &Shared<T>,
    pushed: DocState<T>,
    assumed: Option<&AssumedMaster<T>>,
) -> ReplicationResult<bool> {
    let budget = shared.config.conflict_retry_budget;
    let ids = [pushed.id.clone()];
    let ids = &ids[..];
    let master = &shared.master;
    let context = guard::resolution_context(shared.identifier());
    let context = &context;

    for attempt in 1..=budget {
        shared.check_cancelled()?;
        let current = shared
            .with_retry("read master document", move || {
                master.find_documents_by_id(ids, true)
            })
            .await?
            .remove(&pushed.id);

        let row = match current {
            // Purged on master since the push; try again as an insert.
            None => BulkWriteRow::insert(pushed.clone()),
            Some(current) => {
                match resolve_conflict(shared.conflict_handler.as_ref(), &current, &pushed)? {
                    ConflictResolution::NoOp => {
                        trace!(id = %pushed.id, "conflict states are equal");
                        let row = meta::assumed_master_row(shared, &current, assumed)?;
                        meta::write_assumed_master_states(shared, Direction::Up, vec![row])
                            .await?;
                        return Ok(false);
                    }
                    ConflictResolution::Winner(winner) => {
                        if shared.conflict_handler.is_equal(
                            &winner,
                            &current,
                            "upstream-conflict-winner-is-master",
                        )? {
                            finish_resolution(shared, &pushed, &current, &current, &winner, assumed)
                                .await?;
                            return Ok(true);
                        }
                        BulkWriteRow::update(current, winner)
                    }
                }
            }
        };

        let row = &row;
        let response = shared
            .with_retry("write conflict winner to master", move || {
                master.bulk_write(vec![row.clone()], context.clone())
            })
            .await?;
        if let Some(stored) = response.success.into_iter().next() {
            let master_before = row.previous.clone().unwrap_or_else(|| stored.clone());
            finish_resolution(shared, &pushed, &master_before, &stored, &row.document, assumed)
                .await?;
            return Ok(true);
        }
        match response.error.into_iter().next() {
            Some(err) if err.is_conflict() => {
                debug!(id = %pushed.id, attempt, "master moved during resolution, retrying");
            }
            Some(err) => {
                return Err(ReplicationError::NonConflictWrite {
                    id: err.id,
                    message: err.message,
                })
            }
            None => {}
        }
    }

    warn!(id = %pushed.id, attempts = budget, "conflict retry budget exhausted");
    Err(ReplicationError::ConflictStorm {
        id: pushed.id,
        attempts: budget,
    })
}

/// Writes the winner to the fork and records master's state.
///
/// The fork write expects the pushed state; a newer local edit wins over the
/// winner and gets pushed on the next cycle.
async fn finish_resolution<T: Document>(
    shared: &Shared<T>,
    pushed: &DocState<T>,
    master_before: &DocState<T>,
    master_after: &DocState<T>,
    winner: &DocState<T>,
    assumed: Option<&AssumedMaster<T>>,
) -> ReplicationResult<()> {
    if !shared
        .conflict_handler
        .is_equal(winner, pushed, "upstream-conflict-winner-is-fork")?
    {
        let fork = &shared.fork;
        let row = BulkWriteRow::update(pushed.clone(), winner.clone());
        let row = &row;
        let context = guard::resolution_context(shared.identifier());
        let context = &context;
        let response = shared
            .with_retry("write conflict winner to fork", move || {
                fork.bulk_write(vec![row.clone()], context.clone())
            })
            .await?;
        for err in response.error {
            if !err.is_conflict() {
                return Err(ReplicationError::NonConflictWrite {
                    id: err.id,
                    message: err.message,
                });
            }
            debug!(id = %err.id, "fork changed during resolution, keeping local edit");
        }
    }

    let row = meta::assumed_master_row(shared, master_after, assumed)?;
    meta::write_assumed_master_states(shared, Direction::Up, vec![row]).await?;

    shared.stats.write().up.conflict_writes += 1;
    debug!(id = %pushed.id, "conflict resolved");
    shared.publish_resolution(ResolvedConflict {
        master: master_before.clone(),
        fork: pushed.clone(),
        winner: winner.clone(),
    });
    Ok(())
}
