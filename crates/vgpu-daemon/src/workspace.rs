//! The daemon workspace.
//!
//! One [`Workspace`] owns everything shared between clients: configuration,
//! the parse table, the insertion policy, the checkpoint engine and store,
//! and the kernel metadata cache. Clients are registered by id and driven
//! through [`Workspace::submit`] and [`Workspace::run_pending`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use vgpu_core::checkpoint::snapshot::{compact_snapshot_dir, scan_snapshot_dir};
use vgpu_core::checkpoint::{CheckpointError, FlushReport, OpKind};
use vgpu_core::device::SimulatedDevice;
use vgpu_core::handle::observe_handle_id;
use vgpu_core::{CheckpointEngine, CheckpointPolicy};
use vgpu_storage::{
    CheckpointManifest, CheckpointStore, FileSystemCheckpointStore, KernelMetaCache, RestoreSummary,
};

use crate::client::{Client, QueuedOp};
use crate::config::DaemonConfig;
use crate::coordinator::CheckpointCoordinator;
use crate::error::DaemonError;
use crate::metrics::{CounterSnapshot, DaemonCounters};
use crate::parser::{ApiCall, ParseContext, ParseTable};
use crate::recovery_manager::{RecoveredClient, RecoveryManager};

/// What [`Workspace::run_pending`] executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// API nodes applied.
    pub executed: usize,
    /// Checkpoint nodes executed.
    pub checkpoints: usize,
    /// Handles captured by those checkpoints.
    pub captured: usize,
    /// Bytes returned by device-to-host copies, in queue order.
    pub reads: Vec<Vec<u8>>,
}

/// Shared daemon state and the per-client registry.
pub struct Workspace {
    config: DaemonConfig,
    parse_table: ParseTable,
    policy: CheckpointPolicy,
    engine: CheckpointEngine,
    store: Arc<dyn CheckpointStore>,
    kernel_meta: KernelMetaCache,
    coordinator: CheckpointCoordinator,
    recovery: RecoveryManager,
    clients: RwLock<FxHashMap<u64, Arc<Client>>>,
    next_client_id: AtomicU64,
    counters: Arc<DaemonCounters>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("config", &self.config)
            .field("mode", &self.policy.mode())
            .field("clients", &self.clients.read().len())
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Build a workspace from `config`.
    ///
    /// Snapshots left by an earlier process are scanned so new handle ids
    /// and checkpoint versions never collide with them.
    ///
    /// # Errors
    ///
    /// - [`DaemonError::Config`] for an invalid configuration
    /// - I/O errors creating the snapshot directory or scanning it
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let store: Arc<dyn CheckpointStore> = Arc::new(FileSystemCheckpointStore::new(
            &config.checkpoint_dir,
            config.max_retained_checkpoints,
        ));
        let snapshot_dir = store.snapshot_dir();
        let engine = CheckpointEngine::new(config.engine_config(snapshot_dir.clone()))?;

        let mut max_version = store.load_latest()?.map_or(0, |m| m.checkpoint_version);
        let chains = scan_snapshot_dir(&snapshot_dir)?;
        for (id, chain) in &chains {
            observe_handle_id(*id);
            if let Some(latest) = chain.iter().map(|s| s.version).max() {
                max_version = max_version.max(latest);
            }
        }
        engine.observe_version(max_version);

        let kernel_meta = config
            .kernel_meta_path
            .as_deref()
            .map(KernelMetaCache::load_or_empty)
            .unwrap_or_default();

        let counters = Arc::new(DaemonCounters::new());
        info!(
            mode = %config.checkpoint_mode,
            dir = %config.checkpoint_dir.display(),
            kernels = kernel_meta.len(),
            known_handles = chains.len(),
            version = max_version,
            "workspace ready"
        );
        Ok(Self {
            parse_table: ParseTable::new(),
            policy: CheckpointPolicy::new(config.checkpoint_mode),
            engine,
            coordinator: CheckpointCoordinator::new(Arc::clone(&store), Arc::clone(&counters)),
            recovery: RecoveryManager::new(Arc::clone(&store)),
            store,
            kernel_meta,
            clients: RwLock::new(FxHashMap::default()),
            next_client_id: AtomicU64::new(1),
            counters,
            config,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// The checkpoint engine.
    #[must_use]
    pub fn engine(&self) -> &CheckpointEngine {
        &self.engine
    }

    /// The checkpoint store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// The kernel metadata cache.
    #[must_use]
    pub fn kernel_meta(&self) -> &KernelMetaCache {
        &self.kernel_meta
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Ids of registered clients, ascending.
    #[must_use]
    pub fn client_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn new_device(&self) -> Arc<SimulatedDevice> {
        Arc::new(SimulatedDevice::new(
            self.config.device_ordinal,
            self.config.device_memory_bytes,
        ))
    }

    fn register(&self, client: Client) -> u64 {
        let id = client.id();
        self.clients.write().insert(id, Arc::new(client));
        id
    }

    /// Register a new client with its baseline handles.
    ///
    /// # Errors
    ///
    /// Baseline allocation failures.
    pub fn create_client(&self) -> Result<u64, DaemonError> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Client::new(id, self.new_device(), self.config.max_queued_ops, false)?;
        info!(client_id = id, "client registered");
        Ok(self.register(client))
    }

    /// Look up a client.
    ///
    /// # Errors
    ///
    /// [`DaemonError::UnknownClient`] when `id` is not registered.
    pub fn client(&self, id: u64) -> Result<Arc<Client>, DaemonError> {
        self.clients
            .read()
            .get(&id)
            .cloned()
            .ok_or(DaemonError::UnknownClient(id))
    }

    /// Parse `call`, queue it and let the insertion policy splice in a
    /// checkpoint. Returns the value handed back to the client, if any.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::GraphRejected`] when the queue has no room for
    ///   the call and a checkpoint
    /// - parse errors; a rejected call leaves the queue unchanged
    pub fn submit(&self, client_id: u64, call: &ApiCall) -> Result<Option<u64>, DaemonError> {
        let client = self.client(client_id)?;
        if client.queue().would_overflow(2) {
            return Err(CheckpointError::GraphRejected(format!(
                "client {client_id} queue is full"
            ))
            .into());
        }
        let ctx = ParseContext {
            client: &client,
            kernel_meta: &self.kernel_meta,
        };
        let parsed = self.parse_table.parse(&ctx, call)?;
        let node = parsed.node;
        client.queue().push(QueuedOp {
            node: node.clone(),
            effect: parsed.effect,
        })?;
        let inserted = self
            .policy
            .checkpoint_insertion(&node, client.managers(), client.queue())?;

        DaemonCounters::add(&self.counters.ops_submitted, 1);
        DaemonCounters::add(&self.counters.checkpoints_inserted, inserted as u64);
        Ok(parsed.result)
    }

    /// Execute everything queued for `client_id`, oldest first.
    ///
    /// On failure the failing node is dropped and the nodes after it are
    /// put back at the head of the queue.
    ///
    /// # Errors
    ///
    /// The first device, handle or engine error.
    pub fn run_pending(&self, client_id: u64) -> Result<RunReport, DaemonError> {
        let client = self.client(client_id)?;
        let mut ops = client.queue().take_all();
        let mut report = RunReport::default();

        while let Some(op) = ops.pop_front() {
            let result = match &op.node.kind {
                OpKind::Api => client.apply(op.effect, op.node.stream).map(|read| {
                    report.executed += 1;
                    report.reads.extend(read);
                }),
                OpKind::Checkpoint(task) => self
                    .engine
                    .execute(client.managers(), task)
                    .map(|r| {
                        report.checkpoints += 1;
                        report.captured += r.captured;
                        DaemonCounters::add(&self.counters.bytes_committed, r.bytes_committed);
                    })
                    .map_err(DaemonError::from),
            };
            if let Err(e) = result {
                warn!(client_id, api_id = op.node.api_id, error = %e, "queued op failed");
                client.queue().requeue_front(ops);
                self.count_run(&report);
                return Err(e);
            }
        }
        self.count_run(&report);
        debug!(
            client_id,
            executed = report.executed,
            checkpoints = report.checkpoints,
            "queue drained"
        );
        Ok(report)
    }

    fn count_run(&self, report: &RunReport) {
        DaemonCounters::add(&self.counters.ops_executed, report.executed as u64);
        DaemonCounters::add(&self.counters.checkpoints_executed, report.checkpoints as u64);
        DaemonCounters::add(&self.counters.handles_captured, report.captured as u64);
    }

    /// Wait for outstanding background commits.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::CommitterStopped`] if the committer died.
    pub fn flush(&self) -> Result<FlushReport, DaemonError> {
        let report = self.engine.flush()?;
        DaemonCounters::add(&self.counters.bytes_committed, report.bytes_committed);
        Ok(report)
    }

    /// Run `client_id`'s queue, then write a whole-client checkpoint.
    ///
    /// # Errors
    ///
    /// Queue execution errors, then checkpoint and store errors.
    pub fn dump_client(&self, client_id: u64) -> Result<CheckpointManifest, DaemonError> {
        let client = self.client(client_id)?;
        self.run_pending(client_id)?;
        self.coordinator
            .checkpoint_client(&self.engine, &client, self.policy.mode())
    }

    /// Dump `client_id`, tear down all its handles and unregister it.
    ///
    /// The client stays registered when the dump fails.
    ///
    /// # Errors
    ///
    /// See [`dump_client`](Self::dump_client); tear-down failures.
    pub fn remove_client(&self, client_id: u64) -> Result<CheckpointManifest, DaemonError> {
        let manifest = self.dump_client(client_id)?;
        let client = self.client(client_id)?;
        let released = client.managers().tear_down_all()?;
        self.clients.write().remove(&client_id);
        info!(
            client_id,
            released,
            checkpoint_id = manifest.checkpoint_id,
            "client removed"
        );
        Ok(manifest)
    }

    /// Build a new client from checkpoint `checkpoint_id`, or the latest.
    /// The recovered client gets a fresh id.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NoCheckpoint`], storage and restore errors. Nothing is
    /// registered on failure.
    pub fn recover_client(&self, checkpoint_id: Option<u64>) -> Result<(u64, RecoveredClient), DaemonError> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Client::new(id, self.new_device(), self.config.max_queued_ops, true)?;
        let recovered = self
            .recovery
            .recover_into(checkpoint_id, client.managers(), self.config.pool_size)?;
        self.engine.observe_version(
            recovered
                .summary
                .max_version
                .max(recovered.manifest.checkpoint_version),
        );
        self.count_restores(&recovered.summary);
        info!(
            client_id = id,
            from_client = recovered.manifest.client_id,
            checkpoint_id = recovered.manifest.checkpoint_id,
            "client recovered"
        );
        Ok((self.register(client), recovered))
    }

    /// Reset `client_id`'s device and mark all of its handles `Broken`.
    /// Returns how many handles broke.
    ///
    /// # Errors
    ///
    /// Flush failures, or release errors from marking handles broken.
    pub fn simulate_device_fault(&self, client_id: u64) -> Result<usize, DaemonError> {
        let client = self.client(client_id)?;
        self.flush()?;
        client.device().reset();
        let broken = client.managers().mark_all_broken()?;
        warn!(client_id, broken, "device fault");
        Ok(broken)
    }

    /// Restore every `Broken` handle of `client_id` in place.
    ///
    /// # Errors
    ///
    /// The first restore failure.
    pub fn restore_client(&self, client_id: u64) -> Result<RestoreSummary, DaemonError> {
        let client = self.client(client_id)?;
        let summary = self
            .recovery
            .restore_in_place(client.managers(), self.config.pool_size)?;
        self.count_restores(&summary);
        Ok(summary)
    }

    fn count_restores(&self, summary: &RestoreSummary) {
        DaemonCounters::add(&self.counters.restores_pooled, summary.pooled as u64);
        DaemonCounters::add(&self.counters.restores_rebuilt, summary.rebuilt as u64);
    }

    /// Delete snapshot files superseded by a newer full snapshot, keeping
    /// what every retained checkpoint still replays.
    ///
    /// # Errors
    ///
    /// Flush failures, store listing failures and I/O errors.
    pub fn compact_snapshots(&self) -> Result<usize, DaemonError> {
        self.flush()?;
        let dir = self.engine.snapshot_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let pinned: Vec<u64> = self.store.list()?.into_iter().map(|(_, version)| version).collect();
        Ok(compact_snapshot_dir(dir, &pinned)?)
    }
}
