//! Backing-store abstraction for the grace object.
//!
//! The store keeps, per key, an opaque value blob plus an associated map of
//! UTF-8 member identifiers to single flag bytes. Every conditional write is
//! guarded by the version token returned from the preceding read; a
//! successful write returns the new token so multi-part updates can chain
//! their expectations. Version conflicts are a distinct error variant because
//! the coordinator retries them indefinitely while surfacing everything else.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::trace;

/// Opaque version token supplied by the backing store.
pub type Version = u64;

/// Errors surfaced by grace-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("object {key} not found")]
    NotFound {
        /// Key of the missing object.
        key: String,
    },

    /// `create_if_absent` found an existing object.
    #[error("object {key} already exists")]
    AlreadyExists {
        /// Key of the existing object.
        key: String,
    },

    /// A conditional write lost its race: the object's version no longer
    /// matches the caller's expectation.
    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        /// Key of the contended object.
        key: String,
        /// Version the caller expected.
        expected: Version,
        /// Version actually found.
        found: Version,
    },

    /// Transport or backend failure, surfaced unchanged.
    #[error("store backend error: {msg}")]
    Backend {
        /// Backend-provided description.
        msg: String,
    },
}

/// Synchronous, versioned key-value store holding grace objects.
///
/// Implementations back onto whatever the cluster shares (a RADOS pool, an
/// etcd prefix, a single file for one-node deployments). All calls may fail
/// with [`StoreError::Backend`], which the coordinator surfaces unchanged.
pub trait GraceStore: Send + Sync {
    /// Creates the object with the given value and an empty member map, if
    /// and only if it does not already exist.
    fn create_if_absent(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Reads the value blob and its version.
    fn read(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError>;

    /// Reads the value blob, the full member map, and the version.
    fn read_with_members(
        &self,
        key: &str,
    ) -> Result<(Vec<u8>, BTreeMap<String, u8>, Version), StoreError>;

    /// Replaces the value blob if the version still matches; returns the new
    /// version.
    fn write_value(&self, key: &str, value: &[u8], expected: Version)
        -> Result<Version, StoreError>;

    /// Sets and deletes member entries if the version still matches; returns
    /// the new version.
    fn update_members(
        &self,
        key: &str,
        set: &[(String, u8)],
        delete: &[String],
        expected: Version,
    ) -> Result<Version, StoreError>;

    /// Best-effort wake-up of peer watchers of the object.
    fn notify(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoredObject {
    value: Vec<u8>,
    members: BTreeMap<String, u8>,
    version: Version,
}

/// In-process [`GraceStore`] with real version bumping.
///
/// Used by tests and by single-node deployments that still want the grace
/// state machine without a cluster store behind it.
#[derive(Debug, Default)]
pub struct MemoryGraceStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    notifies: AtomicU64,
}

impl MemoryGraceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notify calls observed, for tests.
    pub fn notify_count(&self) -> u64 {
        self.notifies.load(Ordering::Relaxed)
    }

    /// Raw value bytes of an object, for tests asserting the wire layout.
    pub fn raw_value(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.value.clone())
    }
}

impl GraceStore for MemoryGraceStore {
    fn create_if_absent(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                value: value.to_vec(),
                members: BTreeMap::new(),
                version: 1,
            },
        );
        trace!(key, "grace object created");
        Ok(())
    }

    fn read(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        let objects = self.objects.lock().unwrap();
        let object = objects.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok((object.value.clone(), object.version))
    }

    fn read_with_members(
        &self,
        key: &str,
    ) -> Result<(Vec<u8>, BTreeMap<String, u8>, Version), StoreError> {
        let objects = self.objects.lock().unwrap();
        let object = objects.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok((object.value.clone(), object.members.clone(), object.version))
    }

    fn write_value(
        &self,
        key: &str,
        value: &[u8],
        expected: Version,
    ) -> Result<Version, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        if object.version != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found: object.version,
            });
        }
        object.value = value.to_vec();
        object.version += 1;
        Ok(object.version)
    }

    fn update_members(
        &self,
        key: &str,
        set: &[(String, u8)],
        delete: &[String],
        expected: Version,
    ) -> Result<Version, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        if object.version != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found: object.version,
            });
        }
        for (member, flags) in set {
            object.members.insert(member.clone(), *flags);
        }
        for member in delete {
            object.members.remove(member);
        }
        object.version += 1;
        Ok(object.version)
    }

    fn notify(&self, key: &str) -> Result<(), StoreError> {
        self.notifies.fetch_add(1, Ordering::Relaxed);
        trace!(key, "grace object notify");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_read() {
        let store = MemoryGraceStore::new();
        store.create_if_absent("grace", &[1, 2, 3]).unwrap();
        let (value, version) = store.read("grace").unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert_eq!(version, 1);
    }

    #[test]
    fn test_create_is_exclusive() {
        let store = MemoryGraceStore::new();
        store.create_if_absent("grace", &[0]).unwrap();
        assert!(matches!(
            store.create_if_absent("grace", &[1]),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert_eq!(store.read("grace").unwrap().0, vec![0]);
    }

    #[test]
    fn test_missing_object() {
        let store = MemoryGraceStore::new();
        assert!(matches!(
            store.read("absent"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_conditional_write_bumps_version() {
        let store = MemoryGraceStore::new();
        store.create_if_absent("grace", &[0]).unwrap();
        let v2 = store.write_value("grace", &[1], 1).unwrap();
        assert_eq!(v2, 2);
        assert!(matches!(
            store.write_value("grace", &[2], 1),
            Err(StoreError::VersionConflict { .. })
        ));
        assert_eq!(store.read("grace").unwrap(), (vec![1], 2));
    }

    #[test]
    fn test_update_members_set_and_delete() {
        let store = MemoryGraceStore::new();
        store.create_if_absent("grace", &[0]).unwrap();
        let v2 = store
            .update_members(
                "grace",
                &[("a".to_string(), 2), ("b".to_string(), 3)],
                &[],
                1,
            )
            .unwrap();
        let v3 = store
            .update_members("grace", &[], &["a".to_string()], v2)
            .unwrap();
        assert_eq!(v3, 3);
        let (_, members, _) = store.read_with_members("grace").unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members["b"], 3);
    }

    #[test]
    fn test_notify_counts() {
        let store = MemoryGraceStore::new();
        store.notify("grace").unwrap();
        store.notify("grace").unwrap();
        assert_eq!(store.notify_count(), 2);
    }
}
