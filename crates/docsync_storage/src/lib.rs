//! # docsync storage
//!
//! Document model and storage instance contract for docsync replication.
//!
//! This crate provides the lowest-level abstraction the replication engine
//! talks to. Storage instances are **document stores with optimistic
//! concurrency** - they do not know about replication, checkpoints of other
//! stores, or conflict resolution.
//!
//! ## Design Principles
//!
//! - Every write names the revision it expects to replace
//! - Mismatching writes are rejected per row, never silently merged
//! - Change history is exposed as opaque [`Checkpoint`]s and a change stream
//! - Write origins travel as an explicit [`WriteOrigin`] tag
//!
//! ## Available Instances
//!
//! - [`InMemoryInstance`] - For testing and ephemeral replicas

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod document;
mod error;
mod instance;
mod memory;

pub use context::{WriteContext, WriteOrigin};
pub use document::{now_millis, DocMeta, DocState, Document, Revision};
pub use error::{StorageError, StorageResult};
pub use instance::{
    BulkWriteError, BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeOperation,
    ChangedDocuments, Checkpoint, EventBulk, StorageInstance, WriteErrorKind,
};
pub use memory::InMemoryInstance;
