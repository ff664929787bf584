//! Origin tags for replication writes.
//!
//! The pusher ignores fork changes tagged by its own replication, which keeps
//! downstream applies and conflict winners from bouncing back to master.

use crate::checkpoint::Direction;
use docsync_storage::{DocState, Revision, WriteContext, WriteOrigin};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

/// Returns true if `context` is a downstream apply of `identifier`.
pub fn is_from_downstream(identifier: &str, context: &WriteContext) -> bool {
    matches!(&context.origin, WriteOrigin::Downstream { replication } if replication == identifier)
}

/// Returns true if `context` is a conflict winner written by `identifier`.
pub fn is_from_upstream_resolution(identifier: &str, context: &WriteContext) -> bool {
    matches!(
        &context.origin,
        WriteOrigin::ConflictResolution { replication } if replication == identifier
    )
}

/// Returns true if the pusher of `identifier` must not push this write.
pub fn is_own_fork_write(identifier: &str, context: &WriteContext) -> bool {
    is_from_downstream(identifier, context) || is_from_upstream_resolution(identifier, context)
}

/// Fork states the puller wrote whose assumed master state is not recorded
/// yet.
///
/// Until the assumed master state lands in the meta store, such a state is
/// indistinguishable from a local edit by content alone; the pusher tells
/// them apart by revision.
#[derive(Debug, Default)]
pub(crate) struct UnconfirmedForkWrites {
    /// Held by the puller from its fork write until the result is recorded.
    applying: AsyncMutex<()>,
    revisions: Mutex<HashMap<String, Revision>>,
}

impl UnconfirmedForkWrites {
    /// Blocks classification while a fork write is in flight.
    pub(crate) async fn begin_apply(&self) -> AsyncMutexGuard<'_, ()> {
        self.applying.lock().await
    }

    /// Records states the puller just wrote to the fork.
    pub(crate) fn record<T>(&self, written: &[DocState<T>]) {
        let mut revisions = self.revisions.lock();
        for state in written {
            revisions.insert(state.id.clone(), state.meta.revision.clone());
        }
    }

    /// Forgets states whose assumed master state has been recorded.
    pub(crate) fn confirm<T>(&self, written: &[DocState<T>]) {
        let mut revisions = self.revisions.lock();
        for state in written {
            if revisions.get(&state.id) == Some(&state.meta.revision) {
                revisions.remove(&state.id);
            }
        }
    }

    /// Splits fork states into local ones and ones the puller wrote.
    pub(crate) async fn split_local<T>(
        &self,
        states: Vec<DocState<T>>,
    ) -> (Vec<DocState<T>>, Vec<DocState<T>>) {
        let _applying = self.applying.lock().await;
        let revisions = self.revisions.lock();
        states
            .into_iter()
            .partition(|state| revisions.get(&state.id) != Some(&state.meta.revision))
    }
}

pub(crate) fn downstream_context(identifier: &str) -> WriteContext {
    WriteContext::new(
        WriteOrigin::Downstream {
            replication: identifier.to_string(),
        },
        "replication-downstream",
    )
}

pub(crate) fn upstream_context(identifier: &str) -> WriteContext {
    WriteContext::new(
        WriteOrigin::Upstream {
            replication: identifier.to_string(),
        },
        "replication-upstream",
    )
}

pub(crate) fn resolution_context(identifier: &str) -> WriteContext {
    WriteContext::new(
        WriteOrigin::ConflictResolution {
            replication: identifier.to_string(),
        },
        "replication-conflict-resolution",
    )
}

pub(crate) fn meta_context(identifier: &str, direction: Direction) -> WriteContext {
    let replication = identifier.to_string();
    let origin = match direction {
        Direction::Up => WriteOrigin::Upstream { replication },
        Direction::Down => WriteOrigin::Downstream { replication },
    };
    WriteContext::new(origin, format!("replication-meta-{direction}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_writes_are_recognized() {
        assert!(is_from_downstream("r1", &downstream_context("r1")));
        assert!(is_from_upstream_resolution("r1", &resolution_context("r1")));
        assert!(is_own_fork_write("r1", &downstream_context("r1")));
        assert!(is_own_fork_write("r1", &resolution_context("r1")));
    }

    #[test]
    fn foreign_and_local_writes_are_not() {
        assert!(!is_from_downstream("r1", &downstream_context("r2")));
        assert!(!is_from_upstream_resolution("r1", &resolution_context("r2")));
        assert!(!is_own_fork_write("r1", &WriteContext::local("app")));
        assert!(!is_own_fork_write("r1", &upstream_context("r1")));
    }

    fn written(id: &str, data: u32, previous: Option<&Revision>) -> DocState<u32> {
        let mut state = DocState::new(id, data);
        state.meta.revision = Revision::next(previous, &data, false).unwrap();
        state
    }

    #[tokio::test]
    async fn recorded_fork_writes_are_not_local() {
        let writes = UnconfirmedForkWrites::default();
        let pulled = written("a", 1, None);
        writes.record(&[pulled.clone()]);

        let edited = written("a", 2, Some(&pulled.meta.revision));
        let other = written("b", 1, None);
        let (local, own) = writes
            .split_local(vec![pulled.clone(), edited.clone(), other.clone()])
            .await;
        assert_eq!(own, vec![pulled.clone()]);
        assert_eq!(local, vec![edited, other]);

        writes.confirm(&[pulled.clone()]);
        let (local, own) = writes.split_local(vec![pulled.clone()]).await;
        assert!(own.is_empty());
        assert_eq!(local, vec![pulled]);
    }

    #[tokio::test]
    async fn confirm_keeps_newer_recorded_write() {
        let writes = UnconfirmedForkWrites::default();
        let first = written("a", 1, None);
        let second = written("a", 2, Some(&first.meta.revision));
        writes.record(&[first.clone()]);
        writes.record(&[second.clone()]);
        writes.confirm(&[first]);
        let (_, own) = writes.split_local(vec![second.clone()]).await;
        assert_eq!(own, vec![second]);
    }

    #[test]
    fn meta_context_follows_direction() {
        let ctx = meta_context("r1", Direction::Up);
        assert_eq!(ctx.origin.replication(), Some("r1"));
        assert_eq!(ctx.label, "replication-meta-up");
    }
}
