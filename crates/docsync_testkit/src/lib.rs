//! # docsync testkit
//!
//! Test utilities for docsync replication.
//!
//! This crate provides:
//! - A `Person` document type and fork/master/meta store triples
//! - Polling helpers for asserting eventual convergence
//! - Property-based write generators using proptest
//! - A seeded replication simulation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_replication() {
//!     let harness = ReplicationHarness::new();
//!     let state = harness.start(test_config("users"));
//!     harness.write_fork("alice", Person::new("Alice", 30)).await;
//!     assert!(eventually(Duration::from_secs(2), || harness.converged()).await);
//!     state.cancel().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod simulation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::simulation::*;
    pub use std::time::Duration;
}

pub use fixtures::*;
pub use generators::*;
pub use simulation::*;
