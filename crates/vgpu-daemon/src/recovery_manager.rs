//! Client recovery.
//!
//! Two paths bring a client's handles back:
//! - [`RecoveryManager::recover_into`] rebuilds a fresh client from a stored
//!   checkpoint image, e.g. after a daemon restart.
//! - [`RecoveryManager::restore_in_place`] repairs a live client whose device
//!   was reset and whose handles are all `Broken`.

use std::sync::Arc;

use tracing::{debug, info, warn};
use vgpu_core::handle::RestoreOutcome;
use vgpu_core::{HandleStatus, ManagerSet};
use vgpu_storage::{CheckpointManifest, CheckpointStore, RestorePipeline, RestoreSummary, StorageError};

use crate::error::DaemonError;

/// Result of recovering a client from a checkpoint.
#[derive(Debug, Clone)]
pub struct RecoveredClient {
    /// Manifest the client was recovered from.
    pub manifest: CheckpointManifest,
    /// What the restore pipeline did.
    pub summary: RestoreSummary,
}

/// Restores handles from a [`CheckpointStore`].
#[derive(Clone)]
pub struct RecoveryManager {
    store: Arc<dyn CheckpointStore>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("snapshot_dir", &self.store.snapshot_dir())
            .finish()
    }
}

impl RecoveryManager {
    /// Manager reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Restore checkpoint `checkpoint_id` (or the latest one) into
    /// `managers`, which must have been initialised with `is_restoring` set.
    ///
    /// # Errors
    ///
    /// - [`DaemonError::NoCheckpoint`] when the store is empty
    /// - [`StorageError::CheckpointNotFound`] for an unknown id
    /// - image and restore errors from the pipeline
    pub fn recover_into(
        &self,
        checkpoint_id: Option<u64>,
        managers: &ManagerSet,
        pool_size: u64,
    ) -> Result<RecoveredClient, DaemonError> {
        let manifest = match checkpoint_id {
            Some(id) => self
                .store
                .load_by_id(id)?
                .ok_or(StorageError::CheckpointNotFound(id))?,
            None => self.store.load_latest()?.ok_or(DaemonError::NoCheckpoint)?,
        };
        let image = self.store.open_image(&manifest)?;
        debug!(
            checkpoint_id = manifest.checkpoint_id,
            bytes = image.len(),
            "checkpoint image mapped"
        );

        let summary = RestorePipeline::new(managers)
            .with_pool_size(pool_size)
            .with_max_version(Some(manifest.checkpoint_version))
            .run(&image, &self.store.snapshot_dir())?;
        info!(
            checkpoint_id = manifest.checkpoint_id,
            client_id = manifest.client_id,
            restored = summary.restored(),
            "client recovered"
        );
        Ok(RecoveredClient { manifest, summary })
    }

    /// Restore every `Broken` handle of a live client, kinds in dependency
    /// order, priming each kind's pool first. Stops at the first failure.
    ///
    /// # Errors
    ///
    /// The first restore failure; handles restored before it stay `Active`.
    pub fn restore_in_place(&self, managers: &ManagerSet, pool_size: u64) -> Result<RestoreSummary, DaemonError> {
        let mut summary = RestoreSummary::default();
        for manager in managers.iter() {
            let broken = manager.ids_with_status(HandleStatus::Broken);
            if broken.is_empty() {
                continue;
            }
            manager.preserve_pooled_handles(pool_size)?;
            for id in broken {
                match manager.restore(id) {
                    Ok(RestoreOutcome::Pooled) => summary.pooled += 1,
                    Ok(RestoreOutcome::Rebuilt | RestoreOutcome::AlreadyActive) => summary.rebuilt += 1,
                    Err(e) => {
                        warn!(kind = %manager.kind(), handle_id = %id, error = %e, "in-place restore failed");
                        return Err(e.into());
                    }
                }
            }
        }
        info!(pooled = summary.pooled, rebuilt = summary.rebuilt, "client restored in place");
        Ok(summary)
    }
}
