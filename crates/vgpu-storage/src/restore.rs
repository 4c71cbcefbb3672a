//! Rebuild a client's handles from a checkpoint image.
//!
//! Kinds are processed in dependency order. For each kind every record is
//! reallocated as a `Broken` handle carrying its original id and client
//! address, the pool is primed, and each handle is restored (pool first,
//! snapshot replay second). Parent/child links are re-established by id once
//! every kind is present. The first failure stops the pipeline; handles
//! restored before it stay `Active`.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};
use vgpu_core::checkpoint::snapshot::scan_snapshot_dir;
use vgpu_core::handle::record::HandleRecord;
use vgpu_core::handle::RestoreOutcome;
use vgpu_core::{HandleId, ManagerSet, ResourceKind};

use crate::error::StorageError;
use crate::image::CheckpointImage;

/// What a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Handles reallocated from the image, per kind.
    pub reallocated: BTreeMap<ResourceKind, usize>,
    /// Handles restored from the pool.
    pub pooled: usize,
    /// Handles rebuilt from scratch.
    pub rebuilt: usize,
    /// Highest snapshot version on disk, bounded or not, so the engine can
    /// continue past it without reusing a file name.
    pub max_version: u64,
}

impl RestoreSummary {
    /// Handles restored in total.
    #[must_use]
    pub fn restored(&self) -> usize {
        self.pooled + self.rebuilt
    }
}

/// Drives one client's restore.
#[derive(Debug)]
pub struct RestorePipeline<'a> {
    managers: &'a ManagerSet,
    pool_size: u64,
    max_version: Option<u64>,
}

impl<'a> RestorePipeline<'a> {
    /// Pipeline restoring into `managers`, which must have been initialised
    /// with `is_restoring` set so no baseline handles collide.
    #[must_use]
    pub fn new(managers: &'a ManagerSet) -> Self {
        Self {
            managers,
            pool_size: 0,
            max_version: None,
        }
    }

    /// Pre-restore up to `pool_size` handles per pooling-capable kind.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: u64) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Ignore snapshots newer than `version`, so a checkpoint restores the
    /// state it captured even after later checkpoints wrote on top of it.
    #[must_use]
    pub fn with_max_version(mut self, version: Option<u64>) -> Self {
        self.max_version = version;
        self
    }

    /// Restore every record in `image`, replaying snapshots from `snapshot_dir`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::CorruptImage`] / [`StorageError::ChecksumMismatch`]
    ///   for a damaged image
    /// - [`StorageError::Handle`] wrapping the first reallocation, restore or
    ///   relink failure (`RestoreFailed` for missing snapshots or parents)
    pub fn run(&self, image: &CheckpointImage, snapshot_dir: &Path) -> Result<RestoreSummary, StorageError> {
        let records = image.records()?;
        self.run_records(records, snapshot_dir)
    }

    /// Same as [`run`](Self::run) for already-decoded records.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_records(&self, records: Vec<HandleRecord>, snapshot_dir: &Path) -> Result<RestoreSummary, StorageError> {
        let mut by_kind: BTreeMap<ResourceKind, Vec<HandleRecord>> = BTreeMap::new();
        for record in records {
            by_kind.entry(record.kind).or_default().push(record);
        }
        let mut snapshots = if snapshot_dir.exists() {
            scan_snapshot_dir(snapshot_dir)?
        } else {
            Default::default()
        };

        let mut summary = RestoreSummary {
            max_version: snapshots
                .values()
                .flat_map(|chain| chain.iter().map(|s| s.version))
                .max()
                .unwrap_or(0),
            ..RestoreSummary::default()
        };
        let mut restored: Vec<(ResourceKind, HandleId)> = Vec::new();

        for (kind, records) in by_kind {
            let manager = self.managers.require_manager(kind)?;
            for record in &records {
                let mut chain = snapshots.remove(&record.id).unwrap_or_default();
                if let Some(bound) = self.max_version {
                    chain.retain(|s| s.version <= bound);
                }
                manager.reallocate_single_handle(record, chain)?;
            }
            summary.reallocated.insert(kind, records.len());

            manager.preserve_pooled_handles(self.pool_size)?;
            for record in &records {
                match manager.restore(record.id)? {
                    RestoreOutcome::Pooled => summary.pooled += 1,
                    RestoreOutcome::Rebuilt | RestoreOutcome::AlreadyActive => summary.rebuilt += 1,
                }
                restored.push((kind, record.id));
            }
            debug!(%kind, handles = records.len(), "restored kind");
        }

        for (kind, id) in restored {
            self.managers.require_manager(kind)?.relink(id, self.managers)?;
        }

        info!(
            pooled = summary.pooled,
            rebuilt = summary.rebuilt,
            max_version = summary.max_version,
            "restore pipeline finished"
        );
        Ok(summary)
    }
}
