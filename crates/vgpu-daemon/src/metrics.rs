//! Daemon counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters updated by the workspace.
///
/// All reads and writes use `Ordering::Relaxed`; the numbers are advisory.
#[derive(Debug, Default)]
pub struct DaemonCounters {
    /// API calls accepted by `submit`.
    pub ops_submitted: AtomicU64,
    /// API calls executed by `run_pending`.
    pub ops_executed: AtomicU64,
    /// Checkpoint nodes spliced into client graphs.
    pub checkpoints_inserted: AtomicU64,
    /// Checkpoint nodes executed.
    pub checkpoints_executed: AtomicU64,
    /// Handles whose state was captured.
    pub handles_captured: AtomicU64,
    /// Snapshot bytes committed.
    pub bytes_committed: AtomicU64,
    /// Whole-client checkpoints written to the store.
    pub client_dumps: AtomicU64,
    /// Handles restored from the pool.
    pub restores_pooled: AtomicU64,
    /// Handles rebuilt from snapshots.
    pub restores_rebuilt: AtomicU64,
}

impl DaemonCounters {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            ops_submitted: self.ops_submitted.load(Ordering::Relaxed),
            ops_executed: self.ops_executed.load(Ordering::Relaxed),
            checkpoints_inserted: self.checkpoints_inserted.load(Ordering::Relaxed),
            checkpoints_executed: self.checkpoints_executed.load(Ordering::Relaxed),
            handles_captured: self.handles_captured.load(Ordering::Relaxed),
            bytes_committed: self.bytes_committed.load(Ordering::Relaxed),
            client_dumps: self.client_dumps.load(Ordering::Relaxed),
            restores_pooled: self.restores_pooled.load(Ordering::Relaxed),
            restores_rebuilt: self.restores_rebuilt.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`DaemonCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// API calls accepted.
    pub ops_submitted: u64,
    /// API calls executed.
    pub ops_executed: u64,
    /// Checkpoint nodes inserted.
    pub checkpoints_inserted: u64,
    /// Checkpoint nodes executed.
    pub checkpoints_executed: u64,
    /// Handles captured.
    pub handles_captured: u64,
    /// Snapshot bytes committed.
    pub bytes_committed: u64,
    /// Whole-client checkpoints.
    pub client_dumps: u64,
    /// Pooled restores.
    pub restores_pooled: u64,
    /// Rebuilt restores.
    pub restores_rebuilt: u64,
}
