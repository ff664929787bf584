//! Replication state, lifecycle and idle tracking.

use crate::checkpoint::{self, Direction};
use crate::config::ReplicationConfig;
use crate::conflict::{ConflictHandler, DefaultConflictHandler, ResolvedConflict};
use crate::downstream;
use crate::error::{ReplicationError, ReplicationResult};
use crate::guard::{self, UnconfirmedForkWrites};
use crate::leader::LeadershipGate;
use crate::upstream;
use docsync_storage::{Checkpoint, DocState, Document, StorageInstance, StorageResult, WriteContext};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Capacity of the error and resolved-conflict streams.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The phase a replication loop is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Spawned, waiting for leadership or the first cycle.
    Starting,
    /// Downstream: waiting for master changes.
    Idle,
    /// Downstream: requesting a page from master.
    Fetching,
    /// Downstream: writing a page into fork.
    Applying,
    /// Upstream: waiting for fork changes.
    Watching,
    /// Upstream: debouncing fork changes.
    Collecting,
    /// Upstream: writing to master.
    Pushing,
    /// Upstream: resolving conflicts reported by master.
    Resolving,
    /// The loop has exited.
    Stopped,
}

impl LoopPhase {
    /// Returns true if the loop has or may have pending work.
    pub fn is_active(&self) -> bool {
        !matches!(self, LoopPhase::Idle | LoopPhase::Watching | LoopPhase::Stopped)
    }
}

/// Observable status of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionStatus {
    /// Current phase.
    pub phase: LoopPhase,
    /// Whether the initial backlog has been drained at least once.
    pub first_sync_done: bool,
}

impl DirectionStatus {
    fn starting() -> Self {
        Self {
            phase: LoopPhase::Starting,
            first_sync_done: false,
        }
    }
}

/// Counters for the downstream direction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownstreamStats {
    /// Wake-ups from the master change stream.
    pub master_change_stream_emit: u64,
    /// Drain cycles started.
    pub cycles: u64,
    /// Pages requested from master.
    pub fetches: u64,
    /// Non-empty pages applied to fork.
    pub pages_applied: u64,
    /// Documents written into fork.
    pub documents_applied: u64,
    /// Documents left alone because of a pending local edit.
    pub skipped_pending_local: u64,
    /// Documents already equal on fork.
    pub skipped_equal: u64,
    /// Fork writes rejected by a concurrent local edit.
    pub dropped_conflicts: u64,
    /// Checkpoint writes.
    pub checkpoint_advances: u64,
}

/// Counters for the upstream direction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpstreamStats {
    /// Local change bulks seen on the fork change stream.
    pub fork_change_stream_emit: u64,
    /// Change bulks ignored because this replication wrote them.
    pub ignored_own_writes: u64,
    /// Push cycles started.
    pub cycles: u64,
    /// Pages requested from fork.
    pub fetches: u64,
    /// Non-empty fork pages processed.
    pub pages_pushed: u64,
    /// Documents accepted by master.
    pub documents_pushed: u64,
    /// Documents skipped because master already has them.
    pub skipped_equal: u64,
    /// Documents skipped because the puller wrote them.
    pub skipped_own_writes: u64,
    /// Conflicts reported by master.
    pub conflicts: u64,
    /// Conflicts that required writing a winner.
    pub conflict_writes: u64,
    /// Documents that exhausted their conflict retry budget.
    pub conflict_storms: u64,
    /// Checkpoint writes.
    pub checkpoint_advances: u64,
}

/// Statistics about a replication.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationStats {
    /// Downstream counters.
    pub down: DownstreamStats,
    /// Upstream counters.
    pub up: UpstreamStats,
    /// Retries of transient store failures.
    pub retries: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// A value per direction.
#[derive(Debug, Default)]
pub(crate) struct PerDirection<V> {
    pub(crate) up: V,
    pub(crate) down: V,
}

impl<V> PerDirection<V> {
    pub(crate) fn get(&self, direction: Direction) -> &V {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

/// Input of [`replicate_storage_instance`].
pub struct ReplicationInput<T: Document> {
    /// Replication settings.
    pub config: ReplicationConfig,
    /// The locally-writable replica.
    pub fork: Arc<dyn StorageInstance<T>>,
    /// The authoritative peer.
    pub master: Arc<dyn StorageInstance<T>>,
    /// Store for checkpoints and assumed master states.
    pub meta: Arc<dyn StorageInstance<serde_json::Value>>,
    /// Conflict handler; pure and deterministic.
    pub conflict_handler: Arc<dyn ConflictHandler<T>>,
    /// Optional gate consulted before the loops start.
    pub leadership: Option<Arc<dyn LeadershipGate>>,
}

impl<T: Document> ReplicationInput<T> {
    /// Creates an input using the default conflict handler.
    pub fn new(
        config: ReplicationConfig,
        fork: Arc<dyn StorageInstance<T>>,
        master: Arc<dyn StorageInstance<T>>,
        meta: Arc<dyn StorageInstance<serde_json::Value>>,
    ) -> Self {
        Self {
            config,
            fork,
            master,
            meta,
            conflict_handler: Arc::new(DefaultConflictHandler),
            leadership: None,
        }
    }

    /// Sets the conflict handler.
    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler<T>>) -> Self {
        self.conflict_handler = handler;
        self
    }

    /// Sets the leadership gate.
    pub fn with_leadership_gate(mut self, gate: Arc<dyn LeadershipGate>) -> Self {
        self.leadership = Some(gate);
        self
    }
}

/// State shared by the two loops.
pub(crate) struct Shared<T: Document> {
    pub(crate) config: ReplicationConfig,
    pub(crate) fork: Arc<dyn StorageInstance<T>>,
    pub(crate) master: Arc<dyn StorageInstance<T>>,
    pub(crate) meta: Arc<dyn StorageInstance<serde_json::Value>>,
    pub(crate) conflict_handler: Arc<dyn ConflictHandler<T>>,
    pub(crate) leadership: Option<Arc<dyn LeadershipGate>>,
    pub(crate) canceled: watch::Sender<bool>,
    pub(crate) status: PerDirection<watch::Sender<DirectionStatus>>,
    pub(crate) stats: RwLock<ReplicationStats>,
    pub(crate) last_error: Mutex<Option<ReplicationError>>,
    /// Last written checkpoint document per direction.
    pub(crate) checkpoint_docs: PerDirection<Mutex<Option<DocState<serde_json::Value>>>>,
    pub(crate) unconfirmed: UnconfirmedForkWrites,
    pub(crate) errors: broadcast::Sender<ReplicationError>,
    pub(crate) resolved: broadcast::Sender<ResolvedConflict<T>>,
}

impl<T: Document> Shared<T> {
    pub(crate) fn new(input: ReplicationInput<T>) -> Self {
        let (errors, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (resolved, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: input.config,
            fork: input.fork,
            master: input.master,
            meta: input.meta,
            conflict_handler: input.conflict_handler,
            leadership: input.leadership,
            canceled: watch::channel(false).0,
            status: PerDirection {
                up: watch::channel(DirectionStatus::starting()).0,
                down: watch::channel(DirectionStatus::starting()).0,
            },
            stats: RwLock::new(ReplicationStats::default()),
            last_error: Mutex::new(None),
            checkpoint_docs: PerDirection::default(),
            unconfirmed: UnconfirmedForkWrites::default(),
            errors,
            resolved,
        }
    }

    pub(crate) fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub(crate) fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    /// Fails with `Cancelled` once cancellation was requested.
    pub(crate) fn check_cancelled(&self) -> ReplicationResult<()> {
        if self.is_canceled() {
            Err(ReplicationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub(crate) async fn wait_canceled(&self) {
        let mut rx = self.canceled.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|canceled| *canceled).await;
    }

    pub(crate) fn set_phase(&self, direction: Direction, phase: LoopPhase) {
        self.status.get(direction).send_modify(|s| {
            if s.phase != LoopPhase::Stopped {
                s.phase = phase;
            }
        });
    }

    pub(crate) fn mark_first_sync_done(&self, direction: Direction) {
        self.status
            .get(direction)
            .send_if_modified(|s| !std::mem::replace(&mut s.first_sync_done, true));
        info!(
            replication = %self.identifier(),
            %direction,
            "initial sync complete"
        );
    }

    pub(crate) fn stop(&self, direction: Direction) {
        self.status
            .get(direction)
            .send_modify(|s| s.phase = LoopPhase::Stopped);
    }

    /// Runs a store call, retrying transient failures with backoff.
    pub(crate) async fn with_retry<R, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> ReplicationResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<R>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && !retry.is_exhausted(attempt + 1) => {
                    attempt += 1;
                    let delay = retry.pause_before(attempt);
                    warn!(
                        replication = %self.identifier(),
                        operation,
                        attempt,
                        ?delay,
                        error = %e,
                        "transient store failure, retrying"
                    );
                    self.stats.write().retries += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wait_canceled() => return Err(ReplicationError::Cancelled),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Publishes an error; global errors cancel the replication.
    pub(crate) fn report(&self, direction: Direction, err: ReplicationError) {
        error!(
            replication = %self.identifier(),
            %direction,
            error = %err,
            "replication error"
        );
        self.stats.write().last_error = Some(err.to_string());
        *self.last_error.lock() = Some(err.clone());
        let global = err.is_global();
        // No subscribers is fine.
        let _ = self.errors.send(err);
        if global {
            self.canceled.send_replace(true);
        }
    }

    pub(crate) fn publish_resolution(&self, resolved: ResolvedConflict<T>) {
        let _ = self.resolved.send(resolved);
    }
}

/// A running fork/master replication.
///
/// Created by [`replicate_storage_instance`]. Dropping the state cancels the
/// replication without waiting for the loops to exit; call
/// [`cancel`](Self::cancel) to wait.
pub struct ReplicationState<T: Document> {
    shared: Arc<Shared<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Starts replicating `input.fork` with `input.master`.
///
/// Both loops are spawned on the current tokio runtime immediately; they
/// wait for the leadership gate, if one is configured, before touching
/// either store.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub fn replicate_storage_instance<T: Document>(input: ReplicationInput<T>) -> ReplicationState<T> {
    let shared = Arc::new(Shared::new(input));
    info!(
        replication = %shared.identifier(),
        fork = %shared.fork.name(),
        master = %shared.master.name(),
        live = shared.config.live,
        "starting replication"
    );
    let down = tokio::spawn(downstream::run(Arc::clone(&shared)));
    let up = tokio::spawn(upstream::run(Arc::clone(&shared)));
    ReplicationState {
        shared,
        handles: Mutex::new(vec![down, up]),
    }
}

impl<T: Document> ReplicationState<T> {
    /// Returns the replication identifier.
    pub fn identifier(&self) -> &str {
        self.shared.identifier()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.shared.config
    }

    /// Returns true once cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.shared.is_canceled()
    }

    /// Returns the status of one direction.
    pub fn status(&self, direction: Direction) -> DirectionStatus {
        *self.shared.status.get(direction).borrow()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> ReplicationStats {
        self.shared.stats.read().clone()
    }

    /// Returns the last error published on the error stream.
    pub fn last_error(&self) -> Option<ReplicationError> {
        self.shared.last_error.lock().clone()
    }

    /// Subscribes to errors.
    ///
    /// Document-scoped errors (conflict storms) leave both loops running;
    /// other errors stop the loop that raised them.
    pub fn errors(&self) -> broadcast::Receiver<ReplicationError> {
        self.shared.errors.subscribe()
    }

    /// Subscribes to conflicts resolved by the pusher.
    pub fn resolved_conflicts(&self) -> broadcast::Receiver<ResolvedConflict<T>> {
        self.shared.resolved.subscribe()
    }

    /// Reads the persisted checkpoint of one direction.
    pub async fn get_last_checkpoint(
        &self,
        direction: Direction,
    ) -> ReplicationResult<Option<Checkpoint>> {
        checkpoint::get_last_checkpoint(&self.shared, direction).await
    }

    /// Returns true if the write was a downstream apply of this replication.
    pub fn is_from_downstream(&self, context: &WriteContext) -> bool {
        guard::is_from_downstream(self.identifier(), context)
    }

    /// Returns true if the write was a conflict winner written by this replication.
    pub fn is_from_upstream_resolution(&self, context: &WriteContext) -> bool {
        guard::is_from_upstream_resolution(self.identifier(), context)
    }

    /// Waits until both directions drained their initial backlog once.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped a loop before its first sync, or
    /// `Cancelled`.
    pub async fn await_first_in_sync(&self) -> ReplicationResult<()> {
        let mut done = true;
        for direction in [Direction::Down, Direction::Up] {
            let mut rx = self.shared.status.get(direction).subscribe();
            let status = match rx
                .wait_for(|s| s.first_sync_done || s.phase == LoopPhase::Stopped)
                .await
            {
                Ok(status) => *status,
                Err(_) => return Err(ReplicationError::Cancelled),
            };
            done &= status.first_sync_done;
        }
        if done {
            Ok(())
        } else {
            Err(self.last_error().unwrap_or(ReplicationError::Cancelled))
        }
    }

    /// Waits until neither loop has pending work.
    ///
    /// Resolves again after the next detected change has been processed.
    /// Changes are detected when a loop receives them, so a caller that just
    /// wrote to a store should expect the loops to pick the write up first.
    pub async fn await_idle(&self) -> ReplicationResult<()> {
        if self.is_canceled() {
            return Err(ReplicationError::Cancelled);
        }
        self.await_first_in_sync().await?;
        let mut up = self.shared.status.up.subscribe();
        let mut down = self.shared.status.down.subscribe();
        loop {
            // Give the loops a chance to receive changes already committed.
            tokio::task::yield_now().await;
            let up_open = up.wait_for(|s| !s.phase.is_active()).await.is_ok();
            let down_open = down.wait_for(|s| !s.phase.is_active()).await.is_ok();
            if !up_open || !down_open {
                return Err(ReplicationError::Cancelled);
            }
            let up_idle = !up.borrow().phase.is_active();
            let down_idle = !down.borrow().phase.is_active();
            if up_idle && down_idle {
                return Ok(());
            }
        }
    }

    /// Cancels the replication and waits for both loops to exit.
    ///
    /// In-flight bulk writes finish; no further batch or checkpoint write
    /// starts afterwards.
    pub async fn cancel(&self) {
        if !self.shared.canceled.send_replace(true) {
            info!(replication = %self.identifier(), "cancelling replication");
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(replication = %self.identifier(), error = %e, "replication task failed");
            }
        }
        self.shared.stop(Direction::Down);
        self.shared.stop(Direction::Up);
    }
}

impl<T: Document> Drop for ReplicationState<T> {
    fn drop(&mut self) {
        self.shared.canceled.send_replace(true);
    }
}

impl<T: Document> std::fmt::Debug for ReplicationState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationState")
            .field("identifier", &self.identifier())
            .field("canceled", &self.is_canceled())
            .field("down", &self.status(Direction::Down))
            .field("up", &self.status(Direction::Up))
            .finish()
    }
}
