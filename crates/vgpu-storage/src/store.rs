//! Checkpoint persistence via the [`CheckpointStore`] trait.
//!
//! ## Disk Layout
//!
//! ```text
//! {base_dir}/
//!   checkpoints/
//!     checkpoint_000001/
//!       manifest.json     # CheckpointManifest as pretty-printed JSON
//!       handles.img       # framed handle records
//!     latest.txt          # "checkpoint_000001"
//!   snapshots/
//!     h{id}-v{version}.snap
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use vgpu_core::handle::record::HandleRecord;

use crate::error::StorageError;
use crate::image::{write_image, CheckpointImage};
use crate::manifest::CheckpointManifest;

/// Image file name inside a checkpoint directory.
pub const IMAGE_FILE: &str = "handles.img";
const MANIFEST_FILE: &str = "manifest.json";

fn sync_file(path: &Path) -> Result<(), std::io::Error> {
    let f = fs::OpenOptions::new().write(true).open(path)?;
    f.sync_all()
}

#[allow(clippy::unnecessary_wraps)]
fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let f = fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Write `data` to `path` through a fsynced temp file and a rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
    }
    sync_file(&tmp)?;
    fs::rename(&tmp, path)?;
    sync_dir(dir)
}

/// Checkpoint persistence backend.
///
/// Manifests are written atomically and `latest` only moves once both the
/// image and the manifest are durable.
pub trait CheckpointStore: Send + Sync {
    /// Persist `records` as the image for checkpoint `id`; returns its length.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on write failure.
    fn save_image(&self, id: u64, records: &[HandleRecord]) -> Result<u64, StorageError>;

    /// Persist `manifest` and point `latest` at it.
    ///
    /// # Errors
    ///
    /// I/O or serialization failure.
    fn save(&self, manifest: &CheckpointManifest) -> Result<(), StorageError>;

    /// Most recent checkpoint, or `None` before the first one.
    ///
    /// # Errors
    ///
    /// I/O or deserialization failure.
    fn load_latest(&self) -> Result<Option<CheckpointManifest>, StorageError>;

    /// Checkpoint `id`, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// I/O or deserialization failure.
    fn load_by_id(&self, id: u64) -> Result<Option<CheckpointManifest>, StorageError>;

    /// Map the image belonging to `manifest`.
    ///
    /// # Errors
    ///
    /// See [`CheckpointImage::open`].
    fn open_image(&self, manifest: &CheckpointManifest) -> Result<CheckpointImage, StorageError>;

    /// `(checkpoint_id, checkpoint_version)` pairs, ascending by id.
    ///
    /// # Errors
    ///
    /// I/O failure.
    fn list(&self) -> Result<Vec<(u64, u64)>, StorageError>;

    /// Remove all but the `keep_count` newest checkpoints; returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// I/O failure listing checkpoints.
    fn prune(&self, keep_count: usize) -> Result<usize, StorageError>;

    /// Id to use for the next checkpoint.
    ///
    /// # Errors
    ///
    /// I/O failure listing checkpoints.
    fn next_checkpoint_id(&self) -> Result<u64, StorageError>;

    /// Directory holding per-handle snapshot files.
    fn snapshot_dir(&self) -> PathBuf;
}

/// Filesystem-backed checkpoint store.
///
/// `latest.txt` is a plain pointer file rather than a symlink.
#[derive(Debug, Clone)]
pub struct FileSystemCheckpointStore {
    base_dir: PathBuf,
    max_retained: usize,
}

impl FileSystemCheckpointStore {
    /// Store rooted at `base_dir`. `max_retained == 0` disables auto-pruning.
    /// Directories are created lazily.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, max_retained: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_retained,
        }
    }

    /// Root directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }

    fn checkpoint_dir(&self, id: u64) -> PathBuf {
        self.checkpoints_dir().join(format!("checkpoint_{id:06}"))
    }

    fn manifest_path(&self, id: u64) -> PathBuf {
        self.checkpoint_dir(id).join(MANIFEST_FILE)
    }

    fn latest_path(&self) -> PathBuf {
        self.checkpoints_dir().join("latest.txt")
    }

    fn parse_checkpoint_id(name: &str) -> Option<u64> {
        name.strip_prefix("checkpoint_").and_then(|s| s.parse().ok())
    }

    fn sorted_checkpoint_ids(&self) -> Result<Vec<u64>, StorageError> {
        let dir = self.checkpoints_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().and_then(Self::parse_checkpoint_id))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

impl CheckpointStore for FileSystemCheckpointStore {
    fn save_image(&self, id: u64, records: &[HandleRecord]) -> Result<u64, StorageError> {
        write_image(&self.checkpoint_dir(id).join(IMAGE_FILE), records)
    }

    fn save(&self, manifest: &CheckpointManifest) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(manifest)?;
        write_atomic(&self.manifest_path(manifest.checkpoint_id), json.as_bytes())?;

        let latest = format!("checkpoint_{:06}", manifest.checkpoint_id);
        write_atomic(&self.latest_path(), latest.as_bytes())?;
        info!(
            checkpoint_id = manifest.checkpoint_id,
            client_id = manifest.client_id,
            handles = manifest.total_handles(),
            "checkpoint saved"
        );

        if self.max_retained > 0 {
            if let Err(e) = self.prune(self.max_retained) {
                warn!(error = %e, "checkpoint pruning failed");
            }
        }
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<CheckpointManifest>, StorageError> {
        let latest = self.latest_path();
        if !latest.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&latest)?;
        match Self::parse_checkpoint_id(content.trim()) {
            Some(id) => self.load_by_id(id),
            None => Ok(None),
        }
    }

    fn load_by_id(&self, id: u64) -> Result<Option<CheckpointManifest>, StorageError> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn open_image(&self, manifest: &CheckpointManifest) -> Result<CheckpointImage, StorageError> {
        CheckpointImage::open(&self.checkpoint_dir(manifest.checkpoint_id).join(&manifest.image_file))
    }

    fn list(&self) -> Result<Vec<(u64, u64)>, StorageError> {
        let mut result = Vec::new();
        for id in self.sorted_checkpoint_ids()? {
            if let Some(manifest) = self.load_by_id(id)? {
                result.push((manifest.checkpoint_id, manifest.checkpoint_version));
            }
        }
        Ok(result)
    }

    fn prune(&self, keep_count: usize) -> Result<usize, StorageError> {
        let ids = self.sorted_checkpoint_ids()?;
        if ids.len() <= keep_count {
            return Ok(0);
        }
        let to_remove = ids.len() - keep_count;
        let mut removed = 0;
        for &id in &ids[..to_remove] {
            if fs::remove_dir_all(self.checkpoint_dir(id)).is_ok() {
                removed += 1;
            }
        }
        debug!(removed, kept = keep_count, "pruned checkpoints");
        Ok(removed)
    }

    fn next_checkpoint_id(&self) -> Result<u64, StorageError> {
        Ok(self.sorted_checkpoint_ids()?.last().map_or(1, |id| id + 1))
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }
}
