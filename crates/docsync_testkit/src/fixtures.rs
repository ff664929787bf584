//! Test fixtures and replication helpers.
//!
//! Provides a document type, in-memory store triples and convenience
//! functions for driving a replication in tests.

use docsync_replication::{
    replicate_storage_instance, ReplicationConfig, ReplicationInput, ReplicationState,
    RetryConfig,
};
use docsync_storage::{BulkWriteRow, DocState, InMemoryInstance, StorageInstance, WriteContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Document used throughout the tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Display name.
    pub name: String,
    /// Age in years.
    pub age: u32,
}

impl Person {
    /// Creates a person.
    pub fn new(name: impl Into<String>, age: u32) -> Self {
        Self {
            name: name.into(),
            age,
        }
    }
}

/// Replication config tuned for fast tests.
pub fn test_config(identifier: &str) -> ReplicationConfig {
    ReplicationConfig::new(identifier)
        .with_push_debounce(Duration::from_millis(2))
        .with_leader_poll_interval(Duration::from_millis(5))
        .with_retry(RetryConfig::testing())
}

/// Fork, master and meta stores for one replication.
pub struct ReplicationHarness {
    /// The locally-writable replica.
    pub fork: Arc<InMemoryInstance<Person>>,
    /// The authoritative peer.
    pub master: Arc<InMemoryInstance<Person>>,
    /// Checkpoints and assumed master states.
    pub meta: Arc<InMemoryInstance<serde_json::Value>>,
}

impl ReplicationHarness {
    /// Creates empty stores.
    pub fn new() -> Self {
        Self {
            fork: Arc::new(InMemoryInstance::new("fork")),
            master: Arc::new(InMemoryInstance::new("master")),
            meta: Arc::new(InMemoryInstance::new("meta")),
        }
    }

    /// Builds a replication input over these stores.
    pub fn input(&self, config: ReplicationConfig) -> ReplicationInput<Person> {
        ReplicationInput::new(
            config,
            self.fork.clone(),
            self.master.clone(),
            self.meta.clone(),
        )
    }

    /// Starts a replication with the default conflict handler.
    pub fn start(&self, config: ReplicationConfig) -> ReplicationState<Person> {
        replicate_storage_instance(self.input(config))
    }

    /// Writes a person to the fork as the application would.
    pub async fn write_fork(&self, id: &str, person: Person) -> DocState<Person> {
        write(&self.fork, id, person, None).await
    }

    /// Writes a person to the fork with an explicit last write time.
    pub async fn write_fork_at(&self, id: &str, person: Person, lwt: u64) -> DocState<Person> {
        write(&self.fork, id, person, Some(lwt)).await
    }

    /// Writes a person to master as another client would.
    pub async fn write_master(&self, id: &str, person: Person) -> DocState<Person> {
        write(&self.master, id, person, None).await
    }

    /// Writes a person to master with an explicit last write time.
    pub async fn write_master_at(&self, id: &str, person: Person, lwt: u64) -> DocState<Person> {
        write(&self.master, id, person, Some(lwt)).await
    }

    /// Deletes a document on the fork.
    pub async fn delete_fork(&self, id: &str) {
        delete(&self.fork, id).await;
    }

    /// Deletes a document on master.
    pub async fn delete_master(&self, id: &str) {
        delete(&self.master, id).await;
    }

    /// Returns the live fork payload of `id`.
    pub fn fork_person(&self, id: &str) -> Option<Person> {
        self.fork.get(id).filter(|d| !d.deleted).map(|d| d.data)
    }

    /// Returns the live master payload of `id`.
    pub fn master_person(&self, id: &str) -> Option<Person> {
        self.master.get(id).filter(|d| !d.deleted).map(|d| d.data)
    }

    /// Returns true if both stores hold the same content for every id.
    pub fn converged(&self) -> bool {
        let fork = self.fork.documents();
        let master = self.master.documents();
        fork.len() == master.len() && fork.iter().zip(&master).all(|(f, m)| f.same_content(m))
    }

    /// Panics with both store contents if they differ.
    pub fn assert_converged(&self) {
        assert!(
            self.converged(),
            "fork and master diverged\nfork:   {:?}\nmaster: {:?}",
            self.fork.documents(),
            self.master.documents()
        );
    }
}

impl Default for ReplicationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempts before an application write racing a replication gives up.
const WRITE_ATTEMPTS: usize = 16;

async fn write(
    store: &InMemoryInstance<Person>,
    id: &str,
    person: Person,
    lwt: Option<u64>,
) -> DocState<Person> {
    commit(store, id, |existing| {
        let mut state = match existing {
            Some(existing) => existing.updated(person.clone()),
            None => DocState::new(id, person.clone()),
        };
        if let Some(lwt) = lwt {
            state.meta.lwt = lwt;
        }
        state
    })
    .await
}

async fn delete(store: &InMemoryInstance<Person>, id: &str) {
    commit(store, id, |existing| {
        existing.expect("deleting a missing document").tombstone()
    })
    .await;
}

/// Writes on top of the stored state, re-reading it when a replication
/// wrote the same document in between.
async fn commit<F>(store: &InMemoryInstance<Person>, id: &str, mut next: F) -> DocState<Person>
where
    F: FnMut(Option<DocState<Person>>) -> DocState<Person>,
{
    for _ in 0..WRITE_ATTEMPTS {
        let previous = store.get(id);
        let row = BulkWriteRow {
            document: next(previous.clone()),
            previous,
        };
        let mut response = store
            .bulk_write(vec![row], WriteContext::local("testkit"))
            .await
            .expect("application write failed");
        if let Some(written) = response.success.pop() {
            return written;
        }
        tokio::task::yield_now().await;
    }
    panic!("application write of {id:?} kept conflicting");
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns the last evaluation.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Installs a test-friendly tracing subscriber once.
///
/// Honors `RUST_LOG`; silent by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a harness whose master holds `count` people.
    ///
    /// Ids are zero-padded (`person-0000`) so they sort like their index.
    pub async fn seeded_master(count: usize) -> ReplicationHarness {
        let harness = ReplicationHarness::new();
        for i in 0..count {
            harness
                .write_master(&person_id(i), Person::new(format!("person {i}"), (i % 90) as u32))
                .await;
        }
        harness
    }

    /// Returns the id used for the `index`-th seeded person.
    pub fn person_id(index: usize) -> String {
        format!("person-{index:04}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_update_existing_documents() {
        let harness = ReplicationHarness::new();
        let first = harness.write_fork("alice", Person::new("Alice", 30)).await;
        let second = harness.write_fork("alice", Person::new("Alice", 31)).await;
        assert!(second.revision() > first.revision());
        assert_eq!(harness.fork_person("alice"), Some(Person::new("Alice", 31)));
    }

    #[tokio::test]
    async fn explicit_lwt_is_kept() {
        let harness = ReplicationHarness::new();
        let doc = harness
            .write_master_at("alice", Person::new("Alice", 31), 2_000)
            .await;
        assert_eq!(doc.meta.lwt, 2_000);
    }

    #[tokio::test]
    async fn convergence_compares_content() {
        let harness = ReplicationHarness::new();
        assert!(harness.converged());
        harness.write_fork_at("a", Person::new("A", 1), 1).await;
        assert!(!harness.converged());
        harness.write_master_at("a", Person::new("A", 1), 99).await;
        assert!(harness.converged());
        harness.delete_master("a").await;
        assert!(!harness.converged());
        assert_eq!(harness.master_person("a"), None);
    }

    #[tokio::test]
    async fn seeded_master_scenario() {
        let harness = scenarios::seeded_master(12).await;
        assert_eq!(harness.master.len(), 12);
        assert!(harness.fork.is_empty());
        assert!(harness.master.get(&scenarios::person_id(11)).is_some());
    }

    #[tokio::test]
    async fn eventually_times_out() {
        assert!(eventually(Duration::from_millis(20), || true).await);
        assert!(!eventually(Duration::from_millis(20), || false).await);
    }
}
