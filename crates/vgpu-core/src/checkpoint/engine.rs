//! Executes checkpoint nodes: `add` on the task stream, then `commit`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::committer::{CommitJob, CommitTicket, Committer};
use super::graph::{CheckpointScope, CheckpointTask, ManagerRegistry};
use super::CheckpointError;
use crate::handle::{HandleError, HandleId, HandleManager, HandleStatus};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory receiving per-handle snapshot files.
    pub snapshot_dir: PathBuf,
    /// Commit on the background thread.
    pub async_commit: bool,
    /// Allow delta snapshots against the previous committed image.
    pub delta_snapshots: bool,
    /// Fsync snapshot files and their directory.
    pub fsync: bool,
}

impl EngineConfig {
    /// Defaults: async commit, delta snapshots, fsync on.
    #[must_use]
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            async_commit: true,
            delta_snapshots: true,
            fsync: true,
        }
    }

    /// Enable or disable the background committer.
    #[must_use]
    pub fn with_async_commit(mut self, enabled: bool) -> Self {
        self.async_commit = enabled;
        self
    }

    /// Enable or disable delta snapshots.
    #[must_use]
    pub fn with_delta_snapshots(mut self, enabled: bool) -> Self {
        self.delta_snapshots = enabled;
        self
    }

    /// Enable or disable fsync.
    #[must_use]
    pub fn with_fsync(mut self, enabled: bool) -> Self {
        self.fsync = enabled;
        self
    }
}

/// Outcome of one executed checkpoint node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Version assigned to the node.
    pub version: u64,
    /// Handles whose state was staged by `add`.
    pub captured: usize,
    /// Handles committed inline.
    pub committed: usize,
    /// Commits handed to the background thread.
    pub queued: usize,
    /// Bytes written by inline commits.
    pub bytes_committed: u64,
    /// Handles skipped because they were gone or not `Active`.
    pub skipped: usize,
    /// Handles whose `add` or inline `commit` failed.
    pub failed: usize,
}

/// Result of waiting on outstanding background commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Commits that succeeded.
    pub committed: usize,
    /// Bytes they wrote.
    pub bytes_committed: u64,
    /// Commits that failed.
    pub failed: usize,
}

/// Checkpoint executor shared by every client of a daemon.
#[derive(Debug)]
pub struct CheckpointEngine {
    config: EngineConfig,
    version: AtomicU64,
    committer: Option<Committer>,
    pending: Mutex<Vec<(Arc<HandleManager>, CommitTicket)>>,
}

impl CheckpointEngine {
    /// Create the snapshot directory and, for async commit, spawn the
    /// committer thread.
    ///
    /// # Errors
    ///
    /// I/O errors creating the directory or spawning the thread.
    pub fn new(config: EngineConfig) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&config.snapshot_dir)?;
        let committer = if config.async_commit {
            Some(Committer::spawn()?)
        } else {
            None
        };
        info!(
            dir = %config.snapshot_dir.display(),
            async_commit = config.async_commit,
            delta = config.delta_snapshots,
            "checkpoint engine started"
        );
        Ok(Self {
            config,
            version: AtomicU64::new(0),
            committer,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot directory.
    #[must_use]
    pub fn snapshot_dir(&self) -> &Path {
        &self.config.snapshot_dir
    }

    /// Claim the next checkpoint version.
    pub fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last claimed version.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Make sure future versions exceed `version`, e.g. after recovery.
    pub fn observe_version(&self, version: u64) {
        self.version.fetch_max(version, Ordering::AcqRel);
    }

    /// Number of commits still owned by the background thread.
    #[must_use]
    pub fn pending_commits(&self) -> usize {
        self.pending.lock().len()
    }

    /// Execute a checkpoint node using the configured commit mode.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::CommitterStopped`] if the background thread
    /// is gone. Per-handle failures are counted in the report.
    pub fn execute(&self, registry: &dyn ManagerRegistry, task: &CheckpointTask) -> Result<CheckpointReport, CheckpointError> {
        self.run(registry, task, self.committer.is_some())
    }

    /// Execute a checkpoint node and commit everything inline.
    ///
    /// Used before tearing down a client, where the caller needs the state
    /// durable on return.
    ///
    /// # Errors
    ///
    /// See [`CheckpointEngine::execute`].
    pub fn execute_sync(&self, registry: &dyn ManagerRegistry, task: &CheckpointTask) -> Result<CheckpointReport, CheckpointError> {
        // Queued commits carry older versions; they must land before the
        // inline ones or they would be refused as stale.
        self.flush()?;
        self.run(registry, task, false)
    }

    fn run(&self, registry: &dyn ManagerRegistry, task: &CheckpointTask, background: bool) -> Result<CheckpointReport, CheckpointError> {
        let version = self.next_version();
        let mut report = CheckpointReport {
            version,
            ..CheckpointReport::default()
        };

        for (manager, id) in resolve_targets(registry, &task.scope) {
            if !is_active(&manager, id) {
                report.skipped += 1;
                continue;
            }
            match manager.add(id, version, task.stream) {
                Ok(()) => report.captured += 1,
                Err(HandleError::NotFound(_) | HandleError::ResourceUnavailable { .. }) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(kind = %manager.kind(), handle_id = %id, version, error = %e, "checkpoint add failed");
                    manager.remark_modified(&[id]);
                    report.failed += 1;
                    continue;
                }
            }

            let job = CommitJob {
                manager: Arc::clone(&manager),
                id,
                version,
                stream: task.stream,
                dir: self.config.snapshot_dir.clone(),
                sync: self.config.fsync,
                allow_delta: self.config.delta_snapshots,
            };
            let job = match (&self.committer, background) {
                (Some(committer), true) => match committer.submit(job) {
                    Ok(ticket) => {
                        self.pending.lock().push((manager, ticket));
                        report.queued += 1;
                        continue;
                    }
                    Err(job) => {
                        warn!(handle_id = %id, version, "committer gone, committing inline");
                        job
                    }
                },
                _ => job,
            };
            match job.run() {
                Ok(persisted) => {
                    report.committed += 1;
                    report.bytes_committed += persisted.map_or(0, |p| p.len);
                }
                Err(e) => {
                    warn!(kind = %manager.kind(), handle_id = %id, version, error = %e, "checkpoint commit failed");
                    manager.remark_modified(&[id]);
                    report.failed += 1;
                }
            }
        }

        debug!(
            version,
            captured = report.captured,
            committed = report.committed,
            queued = report.queued,
            skipped = report.skipped,
            failed = report.failed,
            "checkpoint executed"
        );
        Ok(report)
    }

    /// Wait for every outstanding background commit.
    ///
    /// A failed commit re-marks its handle modified so the next checkpoint
    /// captures it again.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::CommitterStopped`] if an acknowledgement
    /// was lost.
    pub fn flush(&self) -> Result<FlushReport, CheckpointError> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut report = FlushReport::default();
        let mut stopped = false;
        for (manager, ticket) in pending {
            let handle = ticket.handle();
            match ticket.wait() {
                Ok(persisted) => {
                    report.committed += 1;
                    report.bytes_committed += persisted.map_or(0, |p| p.len);
                }
                Err(e) => {
                    if matches!(e, CheckpointError::CommitterStopped) {
                        stopped = true;
                    }
                    manager.remark_modified(&[handle.id]);
                    report.failed += 1;
                }
            }
        }
        if stopped {
            return Err(CheckpointError::CommitterStopped);
        }
        Ok(report)
    }
}

fn is_active(manager: &HandleManager, id: HandleId) -> bool {
    manager
        .get(id)
        .is_some_and(|h| h.lock().status() == HandleStatus::Active)
}

fn resolve_targets(registry: &dyn ManagerRegistry, scope: &CheckpointScope) -> Vec<(Arc<HandleManager>, HandleId)> {
    match scope {
        CheckpointScope::Full => registry
            .stateful_kinds()
            .iter()
            .filter_map(|kind| registry.typed_manager(*kind))
            .flat_map(|manager| {
                manager
                    .ids_with_status(HandleStatus::Active)
                    .into_iter()
                    .map(move |id| (Arc::clone(&manager), id))
            })
            .collect(),
        CheckpointScope::Handles(handles) => handles
            .iter()
            .filter_map(|h| registry.typed_manager(h.kind).map(|m| (m, h.id)))
            .collect(),
    }
}
