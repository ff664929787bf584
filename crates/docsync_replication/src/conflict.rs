//! Conflict detection and resolution.
//!
//! A conflict handler is a pure collaborator: given the same master and fork
//! states it must return the same answer on every peer, otherwise replicas
//! resolving the same conflict independently would diverge.

use docsync_storage::{DocState, Document};
use std::cmp::Ordering;
use thiserror::Error;

/// Error raised by a conflict handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: {message}")]
pub struct ConflictHandlerError {
    /// Where the handler was called from.
    pub context: String,
    /// Handler message.
    pub message: String,
}

impl ConflictHandlerError {
    /// Creates a new handler error.
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

/// Decides equality and winners for divergent document states.
///
/// The `context` argument names the call site (for example
/// `"upstream-check-if-equal"`) and is meant for logs only; it must not
/// influence the result.
pub trait ConflictHandler<T: Document>: Send + Sync {
    /// Semantic equality, ignoring volatile metadata.
    fn is_equal(
        &self,
        a: &DocState<T>,
        b: &DocState<T>,
        context: &str,
    ) -> Result<bool, ConflictHandlerError>;

    /// Picks the state both peers converge on.
    ///
    /// Returning `None` keeps the master state.
    fn resolve(
        &self,
        master: &DocState<T>,
        fork: &DocState<T>,
        context: &str,
    ) -> Result<Option<DocState<T>>, ConflictHandlerError>;
}

/// Latest-write-wins conflict handler.
///
/// Equality compares id, payload and deletion flag. Resolution picks the
/// state with the later `lwt`; ties fall back to revision order, then to the
/// canonical JSON encoding of the state, and finally to the master state.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictHandler;

impl DefaultConflictHandler {
    /// Orders the fork state relative to the master state.
    fn compare<T: Document>(
        master: &DocState<T>,
        fork: &DocState<T>,
    ) -> Result<Ordering, ConflictHandlerError> {
        let order = fork
            .meta
            .lwt
            .cmp(&master.meta.lwt)
            .then_with(|| fork.meta.revision.cmp(&master.meta.revision));
        if order != Ordering::Equal {
            return Ok(order);
        }
        Ok(canonical(fork)?.cmp(&canonical(master)?))
    }
}

fn canonical<T: Document>(state: &DocState<T>) -> Result<String, ConflictHandlerError> {
    serde_json::to_string(&(&state.id, state.deleted, &state.data))
        .map_err(|e| ConflictHandlerError::new("canonical-encoding", e.to_string()))
}

impl<T: Document> ConflictHandler<T> for DefaultConflictHandler {
    fn is_equal(
        &self,
        a: &DocState<T>,
        b: &DocState<T>,
        _context: &str,
    ) -> Result<bool, ConflictHandlerError> {
        Ok(a.same_content(b))
    }

    fn resolve(
        &self,
        master: &DocState<T>,
        fork: &DocState<T>,
        _context: &str,
    ) -> Result<Option<DocState<T>>, ConflictHandlerError> {
        match Self::compare(master, fork)? {
            Ordering::Greater => Ok(Some(fork.clone())),
            _ => Ok(Some(master.clone())),
        }
    }
}

/// Outcome of checking a master/fork pair.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution<T> {
    /// The states are semantically equal; nothing to write.
    NoOp,
    /// The state both peers must converge on.
    Winner(DocState<T>),
}

/// Runs `is_equal` and, when needed, `resolve` for one conflict.
pub fn resolve_conflict<T: Document>(
    handler: &dyn ConflictHandler<T>,
    master: &DocState<T>,
    fork: &DocState<T>,
) -> Result<ConflictResolution<T>, ConflictHandlerError> {
    if handler.is_equal(master, fork, "upstream-conflict-check-if-equal")? {
        return Ok(ConflictResolution::NoOp);
    }
    let winner = handler
        .resolve(master, fork, "upstream-conflict-resolve")?
        .unwrap_or_else(|| master.clone());
    Ok(ConflictResolution::Winner(winner))
}

/// A conflict that was resolved by the pusher.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict<T> {
    /// Master state found when the push was rejected.
    pub master: DocState<T>,
    /// Fork state that was pushed.
    pub fork: DocState<T>,
    /// State written to both peers.
    pub winner: DocState<T>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_storage::Revision;

    fn doc(age: u32, lwt: u64) -> DocState<u32> {
        DocState::new("alice", age).with_lwt(lwt)
    }

    #[test]
    fn later_write_wins() {
        let handler = DefaultConflictHandler;
        let master = doc(31, 2_000);
        let fork = doc(30, 1_000);
        let winner = handler.resolve(&master, &fork, "test").unwrap().unwrap();
        assert_eq!(winner.data, 31);

        let winner = handler
            .resolve(&doc(31, 1_000), &doc(30, 2_000), "test")
            .unwrap()
            .unwrap();
        assert_eq!(winner.data, 30);
    }

    #[test]
    fn lwt_tie_breaks_on_revision() {
        let handler = DefaultConflictHandler;
        let mut master = doc(1, 5);
        master.meta.revision = Revision::next(None, &1u32, false).unwrap();
        let mut fork = doc(2, 5);
        fork.meta.revision = Revision::next(Some(&master.meta.revision), &2u32, false).unwrap();

        let winner = handler.resolve(&master, &fork, "test").unwrap().unwrap();
        assert_eq!(winner.data, 2);
    }

    #[test]
    fn full_tie_is_symmetric() {
        let handler = DefaultConflictHandler;
        let a = doc(1, 5);
        let b = doc(2, 5);
        let ab = handler.resolve(&a, &b, "test").unwrap().unwrap();
        let ba = handler.resolve(&b, &a, "test").unwrap().unwrap();
        assert_eq!(ab.data, ba.data);
    }

    #[test]
    fn equality_ignores_meta() {
        let handler = DefaultConflictHandler;
        assert!(handler.is_equal(&doc(1, 1), &doc(1, 99), "test").unwrap());
        assert!(!handler.is_equal(&doc(1, 1), &doc(2, 1), "test").unwrap());
    }

    #[test]
    fn resolve_conflict_short_circuits_equal_states() {
        let res = resolve_conflict(&DefaultConflictHandler, &doc(1, 1), &doc(1, 2)).unwrap();
        assert_eq!(res, ConflictResolution::NoOp);

        let res = resolve_conflict(&DefaultConflictHandler, &doc(1, 1), &doc(2, 2)).unwrap();
        assert!(matches!(res, ConflictResolution::Winner(w) if w.data == 2));
    }

    #[test]
    fn unencodable_tie_is_an_error() {
        let mut data = std::collections::BTreeMap::new();
        data.insert(vec![1u8], 1u32);
        let master = DocState::new("alice", data.clone()).with_lwt(5);
        data.insert(vec![2u8], 2u32);
        let fork = DocState::new("alice", data).with_lwt(5);
        let err = DefaultConflictHandler
            .resolve(&master, &fork, "test")
            .unwrap_err();
        assert_eq!(err.context, "canonical-encoding");
    }

    struct KeepMaster;

    impl ConflictHandler<u32> for KeepMaster {
        fn is_equal(
            &self,
            _a: &DocState<u32>,
            _b: &DocState<u32>,
            _context: &str,
        ) -> Result<bool, ConflictHandlerError> {
            Ok(false)
        }

        fn resolve(
            &self,
            _master: &DocState<u32>,
            _fork: &DocState<u32>,
            _context: &str,
        ) -> Result<Option<DocState<u32>>, ConflictHandlerError> {
            Ok(None)
        }
    }

    #[test]
    fn none_keeps_master() {
        let res = resolve_conflict(&KeepMaster, &doc(7, 1), &doc(8, 2)).unwrap();
        assert!(matches!(res, ConflictResolution::Winner(w) if w.data == 7));
    }

    struct Broken;

    impl ConflictHandler<u32> for Broken {
        fn is_equal(
            &self,
            _a: &DocState<u32>,
            _b: &DocState<u32>,
            context: &str,
        ) -> Result<bool, ConflictHandlerError> {
            Err(ConflictHandlerError::new(context, "boom"))
        }

        fn resolve(
            &self,
            _master: &DocState<u32>,
            _fork: &DocState<u32>,
            context: &str,
        ) -> Result<Option<DocState<u32>>, ConflictHandlerError> {
            Err(ConflictHandlerError::new(context, "boom"))
        }
    }

    #[test]
    fn handler_errors_propagate() {
        let err = resolve_conflict(&Broken, &doc(1, 1), &doc(2, 2)).unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(err.to_string().contains("check-if-equal"));
    }
}
