//! # docsync replication
//!
//! Bidirectional replication between a locally-writable **fork** store and an
//! authoritative **master** store.
//!
//! This crate provides:
//! - A downstream puller (master → fork) driven by checkpoints
//! - An upstream pusher (fork → master) with debounced batching
//! - Conflict detection via optimistic concurrency and pluggable resolution
//! - Durable checkpoints and assumed master states in a meta store
//! - Retry with exponential backoff for transient store failures
//!
//! ## Architecture
//!
//! Two independent tokio tasks run per replication and share a
//! [`ReplicationState`]:
//! 1. The puller pages master's change history into the fork, skipping
//!    documents with pending local edits
//! 2. The pusher pages the fork's change history into master, using the last
//!    known master state as the expected revision
//! 3. Master rejects stale pushes; the pusher resolves them and writes the
//!    winner to both peers
//!
//! ## Key Invariants
//!
//! - A checkpoint only advances after its page is applied
//! - Every replication write carries an origin tag, so it never echoes back
//! - Conflict resolution is deterministic, so peers converge
//! - Processing the same change twice is harmless
//!
//! ## Example
//!
//! ```
//! use docsync_replication::{replicate_storage_instance, ReplicationConfig, ReplicationInput};
//! use docsync_storage::{DocState, InMemoryInstance, WriteContext};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let fork = Arc::new(InMemoryInstance::<u32>::new("fork"));
//! let master = Arc::new(InMemoryInstance::<u32>::new("master"));
//! let meta = Arc::new(InMemoryInstance::<serde_json::Value>::new("meta"));
//! master
//!     .upsert(DocState::new("alice", 30), WriteContext::local("seed"))
//!     .await
//!     .unwrap();
//!
//! let config = ReplicationConfig::new("users").with_live(false);
//! let state = replicate_storage_instance(ReplicationInput::new(
//!     config,
//!     fork.clone(),
//!     master.clone(),
//!     meta,
//! ));
//! state.await_first_in_sync().await.unwrap();
//! assert_eq!(fork.get("alice").unwrap().data, 30);
//! state.cancel().await;
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod conflict;
mod downstream;
mod error;
mod guard;
mod leader;
mod meta;
mod state;
mod upstream;

pub use checkpoint::{checkpoint_document_id, Direction};
pub use config::{ReplicationConfig, RetryConfig};
pub use conflict::{
    resolve_conflict, ConflictHandler, ConflictHandlerError, ConflictResolution,
    DefaultConflictHandler, ResolvedConflict,
};
pub use error::{ReplicationError, ReplicationResult};
pub use guard::{is_from_downstream, is_from_upstream_resolution, is_own_fork_write};
pub use leader::{LeadershipGate, ManualLeadershipGate};
pub use meta::assumed_master_document_id;
pub use state::{
    replicate_storage_instance, DirectionStatus, DownstreamStats, LoopPhase, ReplicationInput,
    ReplicationState, ReplicationStats, UpstreamStats,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
