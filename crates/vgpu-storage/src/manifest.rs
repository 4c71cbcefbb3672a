//! Checkpoint manifest.
//!
//! One manifest describes one whole-client checkpoint: which client it came
//! from, the engine version it was taken at, and how many handles of each
//! kind the image next to it holds. Serialized as pretty JSON.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use vgpu_core::{CheckpointMode, ResourceKind};

/// Current manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Description of one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointManifest {
    /// Manifest format version.
    pub version: u32,
    /// Unique, monotonically increasing checkpoint id.
    pub checkpoint_id: u64,
    /// Client the checkpoint belongs to.
    pub client_id: u64,
    /// Engine version the handle snapshots were committed at.
    pub checkpoint_version: u64,
    /// Creation time (millis since Unix epoch).
    pub timestamp_ms: u64,
    /// Insertion mode active when the checkpoint was taken.
    #[serde(default)]
    pub mode: CheckpointMode,
    /// Handle records per kind.
    #[serde(default)]
    pub handle_counts: BTreeMap<ResourceKind, usize>,
    /// Image file name, relative to the checkpoint directory.
    pub image_file: String,
    /// Image length in bytes.
    #[serde(default)]
    pub image_bytes: u64,
    /// Snapshot bytes committed for this checkpoint.
    #[serde(default)]
    pub snapshot_bytes: u64,
}

impl CheckpointManifest {
    /// A manifest stamped with the current time and no handles.
    #[must_use]
    pub fn new(checkpoint_id: u64, client_id: u64, checkpoint_version: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            version: MANIFEST_FORMAT_VERSION,
            checkpoint_id,
            client_id,
            checkpoint_version,
            timestamp_ms,
            mode: CheckpointMode::default(),
            handle_counts: BTreeMap::new(),
            image_file: crate::store::IMAGE_FILE.to_string(),
            image_bytes: 0,
            snapshot_bytes: 0,
        }
    }

    /// Total handle records.
    #[must_use]
    pub fn total_handles(&self) -> usize {
        self.handle_counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let mut m = CheckpointManifest::new(4, 9, 17);
        m.mode = CheckpointMode::Naive;
        m.handle_counts.insert(ResourceKind::Memory, 3);
        m.handle_counts.insert(ResourceKind::Context, 1);
        m.image_bytes = 512;

        let json = serde_json::to_string_pretty(&m).unwrap();
        assert!(json.contains("\"memory\": 3"));
        let back: CheckpointManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.total_handles(), 4);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "version": 1,
            "checkpoint_id": 2,
            "client_id": 1,
            "checkpoint_version": 5,
            "timestamp_ms": 0,
            "image_file": "handles.img"
        }"#;
        let m: CheckpointManifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.mode, CheckpointMode::Incremental);
        assert!(m.handle_counts.is_empty());
    }
}
