//! Daemon configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use vgpu_core::checkpoint::EngineConfig;
use vgpu_core::CheckpointMode;

use crate::error::DaemonError;

/// Daemon configuration, loadable from TOML.
///
/// ```toml
/// checkpoint_mode = "incremental"
/// checkpoint_dir = "/var/lib/vgpu"
/// async_commit = true
/// max_retained_checkpoints = 3
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Checkpoint insertion strategy.
    pub checkpoint_mode: CheckpointMode,
    /// Root of the checkpoint store.
    pub checkpoint_dir: PathBuf,
    /// Commit snapshots on a background thread.
    pub async_commit: bool,
    /// Allow delta snapshots.
    pub delta_snapshots: bool,
    /// Fsync snapshot files.
    pub fsync: bool,
    /// Whole-client checkpoints to keep; 0 keeps all.
    pub max_retained_checkpoints: usize,
    /// Handles per pooling-capable kind pre-restored before a restore.
    pub pool_size: u64,
    /// Optional prebuilt kernel metadata cache.
    pub kernel_meta_path: Option<PathBuf>,
    /// Simulated device capacity.
    pub device_memory_bytes: u64,
    /// Device ordinal.
    pub device_ordinal: i32,
    /// Operations a client may have queued before submissions are refused.
    pub max_queued_ops: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            checkpoint_mode: CheckpointMode::Incremental,
            checkpoint_dir: PathBuf::from("./vgpu-ckpt"),
            async_commit: true,
            delta_snapshots: true,
            fsync: true,
            max_retained_checkpoints: 3,
            pool_size: 8,
            kernel_meta_path: None,
            device_memory_bytes: 1 << 30,
            device_ordinal: 0,
            max_queued_ops: 4096,
        }
    }
}

impl DaemonConfig {
    /// Defaults rooted at `checkpoint_dir`.
    #[must_use]
    pub fn new(checkpoint_dir: &Path) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ConfigParse`] on malformed TOML and
    /// [`DaemonError::Config`] when the result does not validate.
    pub fn from_toml_str(raw: &str) -> Result<Self, DaemonError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// I/O errors, plus those of [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: &Path) -> Result<Self, DaemonError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Sets the checkpoint mode.
    #[must_use]
    pub fn with_checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    /// Enables or disables background commits.
    #[must_use]
    pub fn with_async_commit(mut self, enabled: bool) -> Self {
        self.async_commit = enabled;
        self
    }

    /// Enables or disables delta snapshots.
    #[must_use]
    pub fn with_delta_snapshots(mut self, enabled: bool) -> Self {
        self.delta_snapshots = enabled;
        self
    }

    /// Sets the number of retained checkpoints.
    #[must_use]
    pub fn with_max_retained(mut self, max: usize) -> Self {
        self.max_retained_checkpoints = max;
        self
    }

    /// Sets the restore pool size.
    #[must_use]
    pub fn with_pool_size(mut self, size: u64) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the kernel metadata cache path.
    #[must_use]
    pub fn with_kernel_meta_path(mut self, path: &Path) -> Self {
        self.kernel_meta_path = Some(path.to_path_buf());
        self
    }

    /// Sets the simulated device capacity.
    #[must_use]
    pub fn with_device_memory(mut self, bytes: u64) -> Self {
        self.device_memory_bytes = bytes;
        self
    }

    /// Sets the per-client queue limit.
    #[must_use]
    pub fn with_max_queued_ops(mut self, max: usize) -> Self {
        self.max_queued_ops = max;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] if the configuration is invalid.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(DaemonError::Config("checkpoint_dir must be set".to_string()));
        }
        if self.device_memory_bytes == 0 {
            return Err(DaemonError::Config("device_memory_bytes must be > 0".to_string()));
        }
        if self.device_ordinal < 0 {
            return Err(DaemonError::Config("device_ordinal must be >= 0".to_string()));
        }
        if self.max_queued_ops == 0 {
            return Err(DaemonError::Config("max_queued_ops must be > 0".to_string()));
        }
        Ok(())
    }

    /// Engine configuration derived from these settings.
    #[must_use]
    pub fn engine_config(&self, snapshot_dir: PathBuf) -> EngineConfig {
        EngineConfig::new(snapshot_dir)
            .with_async_commit(self.async_commit)
            .with_delta_snapshots(self.delta_snapshots)
            .with_fsync(self.fsync)
    }
}
