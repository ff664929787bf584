//! Document states, revisions and write metadata.

use crate::error::StorageResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bound for user document payloads.
///
/// Blanket-implemented for every type that is cloneable, comparable,
/// serializable and thread-safe.
pub trait Document:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Document for T where
    T: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Number of hash bytes kept in a revision string.
const REVISION_HASH_BYTES: usize = 12;

/// A storage-assigned document revision.
///
/// Revisions are opaque to the replication engine except for their total
/// order (`height` first, then `hash`), which is only used as a tie-break.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision {
    /// Number of writes that produced this revision.
    pub height: u64,
    /// Content hash of the revision.
    pub hash: String,
}

impl Revision {
    /// Computes the revision following `previous` for the given content.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the payload cannot be encoded.
    pub fn next<T: Serialize>(
        previous: Option<&Revision>,
        data: &T,
        deleted: bool,
    ) -> StorageResult<Self> {
        let encoded = serde_json::to_vec(data)?;
        let height = previous.map_or(1, |rev| rev.height + 1);
        let mut hasher = Sha256::new();
        if let Some(prev) = previous {
            hasher.update(prev.hash.as_bytes());
        }
        hasher.update(&encoded);
        hasher.update([u8::from(deleted)]);
        let digest = hasher.finalize();
        let hash = digest[..REVISION_HASH_BYTES]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Ok(Self { height, hash })
    }

    /// Returns true if no store has assigned this revision yet.
    pub fn is_unassigned(&self) -> bool {
        self.height == 0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

/// Metadata carried by every document state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    /// Last write time in milliseconds since the Unix epoch.
    pub lwt: u64,
    /// Revision assigned by the store holding this state.
    pub revision: Revision,
}

/// A full document state: payload, deletion flag and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocState<T> {
    /// Stable primary key.
    pub id: String,
    /// User payload.
    pub data: T,
    /// Tombstone flag.
    pub deleted: bool,
    /// Volatile metadata, ignored by semantic equality.
    pub meta: DocMeta,
}

impl<T> DocState<T> {
    /// Creates a live document stamped with the current time.
    pub fn new(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            data,
            deleted: false,
            meta: DocMeta {
                lwt: now_millis(),
                revision: Revision::default(),
            },
        }
    }

    /// Sets the last write time.
    #[must_use]
    pub fn with_lwt(mut self, lwt: u64) -> Self {
        self.meta.lwt = lwt;
        self
    }

    /// Replaces the payload and restamps the last write time.
    #[must_use]
    pub fn updated(mut self, data: T) -> Self {
        self.data = data;
        self.deleted = false;
        self.meta.lwt = now_millis();
        self
    }

    /// Turns this state into a tombstone and restamps the last write time.
    #[must_use]
    pub fn tombstone(mut self) -> Self {
        self.deleted = true;
        self.meta.lwt = now_millis();
        self
    }

    /// Returns the revision assigned by the store.
    pub fn revision(&self) -> &Revision {
        &self.meta.revision
    }
}

impl<T: PartialEq> DocState<T> {
    /// Compares id, payload and deletion flag, ignoring metadata.
    pub fn same_content(&self, other: &DocState<T>) -> bool {
        self.id == other.id && self.deleted == other.deleted && self.data == other.data
    }
}

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_height_grows() {
        let first = Revision::next(None, &"a", false).unwrap();
        assert_eq!(first.height, 1);
        let second = Revision::next(Some(&first), &"b", false).unwrap();
        assert_eq!(second.height, 2);
        assert!(second > first);
    }

    #[test]
    fn revision_depends_on_content_and_tombstone() {
        let live = Revision::next(None, &"a", false).unwrap();
        let dead = Revision::next(None, &"a", true).unwrap();
        let other = Revision::next(None, &"b", false).unwrap();
        assert_ne!(live.hash, dead.hash);
        assert_ne!(live.hash, other.hash);
        assert_eq!(live, Revision::next(None, &"a", false).unwrap());
        assert_eq!(live.hash.len(), REVISION_HASH_BYTES * 2);
    }

    #[test]
    fn unencodable_payload_has_no_revision() {
        let mut data = std::collections::BTreeMap::new();
        data.insert(vec![1u8], 1u32);
        let err = Revision::next(None, &data, false).unwrap_err();
        assert!(matches!(err, crate::StorageError::Serialization(_)));
    }

    #[test]
    fn same_content_ignores_meta() {
        let a = DocState::new("x", 1u32).with_lwt(10);
        let mut b = DocState::new("x", 1u32).with_lwt(20);
        b.meta.revision = Revision::next(None, &1u32, false).unwrap();
        assert!(a.same_content(&b));
        assert!(!a.same_content(&b.clone().tombstone()));
        assert!(!a.same_content(&b.updated(2)));
    }

    #[test]
    fn revision_display() {
        let rev = Revision {
            height: 3,
            hash: "abc".into(),
        };
        assert_eq!(rev.to_string(), "3-abc");
        assert!(Revision::default().is_unassigned());
    }
}
