//! Write contexts and origin tags.
//!
//! Every bulk write carries a [`WriteContext`]. The store copies it onto the
//! [`crate::EventBulk`] it emits, so change-stream consumers can tell which
//! component produced a write without inspecting document fields.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which component produced a write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WriteOrigin {
    /// A write made by the application.
    Local,
    /// A master state applied to the fork by a replication's puller.
    Downstream {
        /// Identifier of the replication that wrote it.
        replication: String,
    },
    /// A fork state pushed to the master by a replication's pusher.
    Upstream {
        /// Identifier of the replication that wrote it.
        replication: String,
    },
    /// A conflict winner written by a replication's pusher.
    ConflictResolution {
        /// Identifier of the replication that wrote it.
        replication: String,
    },
}

impl WriteOrigin {
    /// Returns the replication identifier for replication-made writes.
    pub fn replication(&self) -> Option<&str> {
        match self {
            WriteOrigin::Local => None,
            WriteOrigin::Downstream { replication }
            | WriteOrigin::Upstream { replication }
            | WriteOrigin::ConflictResolution { replication } => Some(replication),
        }
    }
}

impl fmt::Display for WriteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOrigin::Local => write!(f, "local"),
            WriteOrigin::Downstream { replication } => write!(f, "downstream({replication})"),
            WriteOrigin::Upstream { replication } => write!(f, "upstream({replication})"),
            WriteOrigin::ConflictResolution { replication } => {
                write!(f, "conflict-resolution({replication})")
            }
        }
    }
}

/// Context attached to a bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteContext {
    /// Origin tag used for loop guarding.
    pub origin: WriteOrigin,
    /// Free-form label for logs.
    pub label: String,
}

impl WriteContext {
    /// Creates a context for an application write.
    pub fn local(label: impl Into<String>) -> Self {
        Self {
            origin: WriteOrigin::Local,
            label: label.into(),
        }
    }

    /// Creates a context with the given origin.
    pub fn new(origin: WriteOrigin, label: impl Into<String>) -> Self {
        Self {
            origin,
            label: label.into(),
        }
    }
}

impl fmt::Display for WriteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.label, self.origin)
    }
}
