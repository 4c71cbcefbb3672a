//! Whole-client checkpoints.
//!
//! A client dump commits every active stateful handle synchronously, writes
//! the records of all live handles to an image and publishes a manifest.
//! Snapshot files stay in the store's shared snapshot directory; the image
//! only refers to them by handle id.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use vgpu_core::checkpoint::{CheckpointScope, CheckpointTask};
use vgpu_core::device::DEFAULT_STREAM;
use vgpu_core::{CheckpointEngine, CheckpointMode};
use vgpu_storage::{CheckpointManifest, CheckpointStore};

use crate::client::Client;
use crate::error::DaemonError;
use crate::metrics::DaemonCounters;

/// Writes whole-client checkpoints into a [`CheckpointStore`].
#[derive(Clone)]
pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    counters: Arc<DaemonCounters>,
    // Held from id allocation until the manifest is saved.
    publish: Arc<Mutex<()>>,
}

impl std::fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("snapshot_dir", &self.store.snapshot_dir())
            .finish_non_exhaustive()
    }
}

impl CheckpointCoordinator {
    /// Coordinator writing into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, counters: Arc<DaemonCounters>) -> Self {
        Self {
            store,
            counters,
            publish: Arc::new(Mutex::new(())),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Dump `client` and return the manifest that was saved.
    ///
    /// Outstanding background commits are flushed first, so every snapshot
    /// the image relies on is durable before `latest` moves. Concurrent
    /// dumps through clones of one coordinator get distinct checkpoint ids.
    ///
    /// # Errors
    ///
    /// Engine errors, handle record encoding errors and store I/O errors.
    pub fn checkpoint_client(
        &self,
        engine: &CheckpointEngine,
        client: &Client,
        mode: CheckpointMode,
    ) -> Result<CheckpointManifest, DaemonError> {
        let flushed = engine.flush()?;
        let task = CheckpointTask {
            scope: CheckpointScope::Full,
            stream: DEFAULT_STREAM,
        };
        let report = engine.execute_sync(client.managers(), &task)?;

        let mut records = Vec::new();
        let mut handle_counts = BTreeMap::new();
        for manager in client.managers().iter() {
            let kind_records = manager.records()?;
            if !kind_records.is_empty() {
                handle_counts.insert(manager.kind(), kind_records.len());
            }
            records.extend(kind_records);
        }

        let manifest = {
            let _publishing = self.publish.lock();
            let id = self.store.next_checkpoint_id()?;
            let image_bytes = self.store.save_image(id, &records)?;
            let mut manifest = CheckpointManifest::new(id, client.id(), report.version);
            manifest.mode = mode;
            manifest.handle_counts = handle_counts;
            manifest.image_bytes = image_bytes;
            manifest.snapshot_bytes = report.bytes_committed + flushed.bytes_committed;
            self.store.save(&manifest)?;
            manifest
        };
        let id = manifest.checkpoint_id;

        DaemonCounters::add(&self.counters.handles_captured, report.captured as u64);
        DaemonCounters::add(&self.counters.bytes_committed, manifest.snapshot_bytes);
        DaemonCounters::add(&self.counters.client_dumps, 1);
        info!(
            client_id = client.id(),
            checkpoint_id = id,
            version = report.version,
            handles = records.len(),
            bytes = manifest.snapshot_bytes,
            "client checkpointed"
        );
        Ok(manifest)
    }
}
