//! Property-based test generators using proptest.
//!
//! Ids are drawn from a small pool so that generated writes collide on the
//! same documents and exercise conflict handling.

use crate::fixtures::{Person, ReplicationHarness};
use docsync_storage::DocState;
use proptest::prelude::*;

/// Number of distinct document ids generated.
pub const ID_POOL: usize = 4;

/// Which store a generated write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The fork.
    Fork,
    /// The master.
    Master,
}

/// A generated application write.
#[derive(Debug, Clone)]
pub enum WriteOperation {
    /// Insert or update a document.
    Put {
        /// Target store.
        side: Side,
        /// Document id.
        id: String,
        /// New payload.
        person: Person,
        /// Last write time.
        lwt: u64,
    },
    /// Delete a document if it exists.
    Delete {
        /// Target store.
        side: Side,
        /// Document id.
        id: String,
    },
}

impl WriteOperation {
    /// Applies the write to the harness stores.
    pub async fn apply(&self, harness: &ReplicationHarness) {
        match self {
            WriteOperation::Put {
                side,
                id,
                person,
                lwt,
            } => {
                match side {
                    Side::Fork => harness.write_fork_at(id, person.clone(), *lwt).await,
                    Side::Master => harness.write_master_at(id, person.clone(), *lwt).await,
                };
            }
            WriteOperation::Delete { side, id } => {
                let store = match side {
                    Side::Fork => &harness.fork,
                    Side::Master => &harness.master,
                };
                if store.get(id).is_some_and(|d| !d.deleted) {
                    match side {
                        Side::Fork => harness.delete_fork(id).await,
                        Side::Master => harness.delete_master(id).await,
                    }
                }
            }
        }
    }
}

/// Strategy for document ids from the shared pool.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    (0..ID_POOL).prop_map(|i| format!("doc-{i}"))
}

/// Strategy for people.
pub fn person_strategy() -> impl Strategy<Value = Person> {
    (
        prop::string::string_regex("[A-Z][a-z]{0,7}").expect("Invalid regex"),
        0u32..120,
    )
        .prop_map(|(name, age)| Person::new(name, age))
}

/// Strategy for last write times; small range to force ties.
pub fn lwt_strategy() -> impl Strategy<Value = u64> {
    1u64..50
}

/// Strategy for a target store.
pub fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Fork), Just(Side::Master)]
}

/// Strategy for a single write.
pub fn write_operation_strategy() -> impl Strategy<Value = WriteOperation> {
    prop_oneof![
        4 => (side_strategy(), doc_id_strategy(), person_strategy(), lwt_strategy())
            .prop_map(|(side, id, person, lwt)| WriteOperation::Put { side, id, person, lwt }),
        1 => (side_strategy(), doc_id_strategy())
            .prop_map(|(side, id)| WriteOperation::Delete { side, id }),
    ]
}

/// Strategy for a sequence of writes.
pub fn write_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<WriteOperation>> {
    prop::collection::vec(write_operation_strategy(), min_ops..max_ops)
}

/// Strategy for a standalone document state, revision left unassigned.
pub fn doc_state_strategy() -> impl Strategy<Value = DocState<Person>> {
    (doc_id_strategy(), person_strategy(), lwt_strategy(), any::<bool>()).prop_map(
        |(id, person, lwt, deleted)| {
            let mut state = DocState::new(id, person).with_lwt(lwt);
            state.deleted = deleted;
            state
        },
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for tests that spin up a runtime per case.
    #[must_use]
    pub fn async_cases() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 50,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn ids_come_from_the_pool(id in doc_id_strategy()) {
            let index: usize = id.trim_start_matches("doc-").parse().unwrap();
            prop_assert!(index < ID_POOL);
        }

        #[test]
        fn people_have_names(person in person_strategy()) {
            let first = person.name.chars().next();
            prop_assert!(first.is_some_and(|c| c.is_ascii_uppercase()));
        }

        #[test]
        fn sequences_respect_bounds(ops in write_sequence_strategy(2, 6)) {
            prop_assert!(ops.len() >= 2 && ops.len() < 6);
        }
    }
}
