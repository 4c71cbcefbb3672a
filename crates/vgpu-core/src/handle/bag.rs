//! Per-handle versioned snapshot storage.
//!
//! `add` stages a device-resident copy of the handle's state under a version
//! id; `commit` turns a staged (or live) copy into a [`PersistedSnapshot`] on
//! durable storage. Persisted snapshots are either full images or deltas
//! against the previous committed image, so restore replays the newest full
//! snapshot followed by every later delta.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use bytes::Bytes;

use super::{HandleError, HandleId};

/// A staged copy of handle state living in a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Checkpoint version.
    pub version: u64,
    /// Physical address of the staging buffer.
    pub addr: u64,
    /// Bytes captured.
    pub len: u64,
}

/// A snapshot flushed to durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSnapshot {
    /// Checkpoint version.
    pub version: u64,
    /// Snapshot file.
    pub path: PathBuf,
    /// Whether the file holds a delta against the previous version.
    pub delta: bool,
    /// Encoded file length.
    pub len: u64,
}

/// Versioned snapshot storage owned by one handle.
#[derive(Debug)]
pub struct CheckpointBag {
    owner: HandleId,
    added: BTreeSet<u64>,
    staged: BTreeMap<u64, DeviceSnapshot>,
    persisted: BTreeMap<u64, PersistedSnapshot>,
    host_image: Option<Bytes>,
}

impl CheckpointBag {
    pub(crate) fn new(owner: HandleId) -> Self {
        Self {
            owner,
            added: BTreeSet::new(),
            staged: BTreeMap::new(),
            persisted: BTreeMap::new(),
            host_image: None,
        }
    }

    /// Latest committed version.
    #[must_use]
    pub fn latest_version(&self) -> Option<u64> {
        self.persisted.keys().next_back().copied()
    }

    /// Whether `version` has been committed.
    #[must_use]
    pub fn is_committed(&self, version: u64) -> bool {
        self.persisted.contains_key(&version)
    }

    /// Whether `add` has completed for exactly `version` and it is not yet
    /// committed.
    #[must_use]
    pub fn has_added(&self, version: u64) -> bool {
        self.added.contains(&version)
    }

    /// Whether `version` is older than or equal to the latest commit, so
    /// committing it would roll the persisted state backwards.
    #[must_use]
    pub fn is_stale(&self, version: u64) -> bool {
        self.latest_version().is_some_and(|latest| version <= latest)
    }

    /// Staged snapshot for `version`.
    #[must_use]
    pub fn staged(&self, version: u64) -> Option<&DeviceSnapshot> {
        self.staged.get(&version)
    }

    /// Newest staged snapshot.
    #[must_use]
    pub fn latest_staged(&self) -> Option<DeviceSnapshot> {
        self.staged.values().next_back().copied()
    }

    /// Number of staged snapshots awaiting commit.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Persisted snapshots in version order.
    pub fn persisted(&self) -> impl Iterator<Item = &PersistedSnapshot> {
        self.persisted.values()
    }

    /// Newest full snapshot followed by every later delta, oldest first.
    ///
    /// Returns `None` when no full snapshot anchors the chain.
    #[must_use]
    pub fn restore_chain(&self) -> Option<Vec<PersistedSnapshot>> {
        let mut chain = Vec::new();
        for snapshot in self.persisted.values().rev() {
            chain.push(snapshot.clone());
            if !snapshot.delta {
                chain.reverse();
                return Some(chain);
            }
        }
        None
    }

    /// Version the handle would hold after a restore.
    #[must_use]
    pub fn restore_target_version(&self) -> Option<u64> {
        self.latest_version().max(self.latest_staged().map(|s| s.version))
    }

    /// Stage a device copy. Returns a replaced snapshot of the same version,
    /// whose buffer the caller must free.
    pub(crate) fn stage(&mut self, snapshot: DeviceSnapshot) -> Result<Option<DeviceSnapshot>, HandleError> {
        if self.is_stale(snapshot.version) {
            return Err(HandleError::VersionConflict {
                id: self.owner,
                version: snapshot.version,
                reason: "version is not newer than the latest commit".into(),
            });
        }
        self.added.insert(snapshot.version);
        Ok(self.staged.insert(snapshot.version, snapshot))
    }

    pub(crate) fn take_staged(&mut self, version: u64) -> Option<DeviceSnapshot> {
        self.staged.remove(&version)
    }

    /// Remove every staged snapshot; the caller frees the buffers.
    pub(crate) fn drain_staged(&mut self) -> Vec<DeviceSnapshot> {
        std::mem::take(&mut self.staged).into_values().collect()
    }

    /// Record a committed snapshot. Every added version up to it is retired;
    /// staged copies older than it are returned for the caller to free.
    pub(crate) fn record_persisted(&mut self, snapshot: PersistedSnapshot) -> Result<Vec<DeviceSnapshot>, HandleError> {
        if self.persisted.contains_key(&snapshot.version) {
            return Err(HandleError::VersionConflict {
                id: self.owner,
                version: snapshot.version,
                reason: "version already committed".into(),
            });
        }
        if self.is_stale(snapshot.version) {
            return Err(HandleError::VersionConflict {
                id: self.owner,
                version: snapshot.version,
                reason: "version is older than the latest commit".into(),
            });
        }
        let version = snapshot.version;
        self.persisted.insert(version, snapshot);
        self.added = self.added.split_off(&(version + 1));
        let newer = self.staged.split_off(&(version + 1));
        Ok(std::mem::replace(&mut self.staged, newer).into_values().collect())
    }

    pub(crate) fn host_image(&self) -> Option<&Bytes> {
        self.host_image.as_ref()
    }

    /// Keep `image` as the base for the next delta, or drop the base when
    /// deltas are off.
    pub(crate) fn set_host_image(&mut self, image: Option<Bytes>) {
        self.host_image = image;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(version: u64, delta: bool) -> PersistedSnapshot {
        PersistedSnapshot {
            version,
            path: PathBuf::from(format!("v{version}.snap")),
            delta,
            len: 0,
        }
    }

    #[test]
    fn test_version_never_committed_twice() {
        let mut bag = CheckpointBag::new(HandleId(1));
        bag.record_persisted(persisted(1, false)).unwrap();
        let err = bag.record_persisted(persisted(1, false)).unwrap_err();
        assert!(matches!(err, HandleError::VersionConflict { version: 1, .. }));
        assert_eq!(bag.latest_version(), Some(1));
    }

    #[test]
    fn test_stage_rejects_stale_version() {
        let mut bag = CheckpointBag::new(HandleId(1));
        bag.record_persisted(persisted(5, false)).unwrap();
        let stale = DeviceSnapshot {
            version: 5,
            addr: 0x10,
            len: 4,
        };
        assert!(bag.stage(stale).is_err());
        assert!(!bag.has_added(5));
    }

    #[test]
    fn test_stage_tracks_added_versions() {
        let mut bag = CheckpointBag::new(HandleId(1));
        assert!(!bag.has_added(1));
        let first = DeviceSnapshot {
            version: 1,
            addr: 0x10,
            len: 4,
        };
        assert_eq!(bag.stage(first).unwrap(), None);
        let again = DeviceSnapshot { addr: 0x20, ..first };
        assert_eq!(bag.stage(again).unwrap(), Some(first));
        assert!(bag.has_added(1));
        assert_eq!(bag.staged_len(), 1);
        assert_eq!(bag.take_staged(1), Some(again));
        assert_eq!(bag.take_staged(1), None);
    }

    #[test]
    fn test_add_must_match_commit_version() {
        let mut bag = CheckpointBag::new(HandleId(1));
        let v2 = DeviceSnapshot {
            version: 2,
            addr: 0x10,
            len: 4,
        };
        bag.stage(v2).unwrap();
        assert!(bag.has_added(2));
        assert!(!bag.has_added(1));
        assert!(!bag.has_added(3));
    }

    #[test]
    fn test_commit_retires_older_versions() {
        let mut bag = CheckpointBag::new(HandleId(1));
        for version in 1..=3 {
            bag.stage(DeviceSnapshot {
                version,
                addr: 0x10 * version,
                len: 4,
            })
            .unwrap();
        }
        let leftovers = bag.record_persisted(persisted(2, false)).unwrap();
        let freed: Vec<u64> = leftovers.iter().map(|s| s.version).collect();
        assert_eq!(freed, vec![1, 2]);
        assert!(!bag.has_added(1));
        assert!(bag.has_added(3));
        assert_eq!(bag.staged_len(), 1);

        assert!(matches!(
            bag.record_persisted(persisted(1, false)),
            Err(HandleError::VersionConflict { version: 1, .. })
        ));
        assert_eq!(bag.latest_version(), Some(2));
    }

    #[test]
    fn test_restore_chain_starts_at_newest_full() {
        let mut bag = CheckpointBag::new(HandleId(1));
        bag.record_persisted(persisted(1, false)).unwrap();
        bag.record_persisted(persisted(2, true)).unwrap();
        bag.record_persisted(persisted(3, false)).unwrap();
        bag.record_persisted(persisted(4, true)).unwrap();
        bag.record_persisted(persisted(5, true)).unwrap();

        let versions: Vec<u64> = bag.restore_chain().unwrap().iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[test]
    fn test_restore_chain_requires_full_anchor() {
        let mut bag = CheckpointBag::new(HandleId(1));
        assert!(bag.restore_chain().is_none());
        bag.record_persisted(persisted(2, true)).unwrap();
        assert!(bag.restore_chain().is_none());
    }
}
