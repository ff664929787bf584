//! Leadership gating.
//!
//! When several processes share one fork, only the leader should replicate.
//! The gate is asked before the loops start and again every
//! `leader_poll_interval` until it grants leadership.

use crate::state::Shared;
use async_trait::async_trait;
use docsync_storage::Document;
use tokio::sync::watch;
use tracing::debug;

/// Decides whether this process may run the replication.
#[async_trait]
pub trait LeadershipGate: Send + Sync {
    /// Returns true if this process currently holds leadership.
    async fn is_leader(&self) -> bool;
}

/// A gate whose answer is set by hand.
#[derive(Debug)]
pub struct ManualLeadershipGate {
    leader: watch::Sender<bool>,
}

impl ManualLeadershipGate {
    /// Creates a gate with the given initial answer.
    pub fn new(leader: bool) -> Self {
        Self {
            leader: watch::channel(leader).0,
        }
    }

    /// Grants or revokes leadership.
    pub fn set_leader(&self, leader: bool) {
        self.leader.send_replace(leader);
    }
}

#[async_trait]
impl LeadershipGate for ManualLeadershipGate {
    async fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }
}

/// Waits until the gate grants leadership.
///
/// Returns false if the replication was canceled first.
pub(crate) async fn wait_for_leadership<T: Document>(shared: &Shared<T>) -> bool {
    let Some(gate) = shared.leadership.as_ref() else {
        return !shared.is_canceled();
    };
    loop {
        if shared.is_canceled() {
            return false;
        }
        if gate.is_leader().await {
            return !shared.is_canceled();
        }
        debug!(replication = %shared.identifier(), "waiting for leadership");
        tokio::select! {
            _ = tokio::time::sleep(shared.config.leader_poll_interval) => {}
            _ = shared.wait_canceled() => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::state::ReplicationInput;
    use docsync_storage::InMemoryInstance;
    use std::sync::Arc;
    use std::time::Duration;

    fn shared(gate: Option<Arc<ManualLeadershipGate>>) -> Arc<Shared<u32>> {
        let mut input = ReplicationInput::new(
            ReplicationConfig::new("r").with_leader_poll_interval(Duration::from_millis(5)),
            Arc::new(InMemoryInstance::<u32>::new("fork")),
            Arc::new(InMemoryInstance::<u32>::new("master")),
            Arc::new(InMemoryInstance::<serde_json::Value>::new("meta")),
        );
        if let Some(gate) = gate {
            input = input.with_leadership_gate(gate);
        }
        Arc::new(Shared::new(input))
    }

    #[tokio::test]
    async fn no_gate_means_leader() {
        assert!(wait_for_leadership(&shared(None)).await);
    }

    #[tokio::test]
    async fn waits_until_granted() {
        let gate = Arc::new(ManualLeadershipGate::new(false));
        let shared = shared(Some(Arc::clone(&gate)));
        let waiter = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { wait_for_leadership(&shared).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        gate.set_leader(true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn cancel_stops_waiting() {
        let gate = Arc::new(ManualLeadershipGate::new(false));
        let shared = shared(Some(gate));
        let waiter = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { wait_for_leadership(&shared).await }
        });
        shared.canceled.send_replace(true);
        assert!(!waiter.await.unwrap());
    }
}
