//! Background commit thread.
//!
//! `add` must run on the caller's stream, but `commit` only moves bytes from
//! a staging buffer to disk, so it is handed to a dedicated thread and the
//! caller keeps a [`CommitTicket`] to wait on.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::CheckpointError;
use crate::device::StreamId;
use crate::handle::bag::PersistedSnapshot;
use crate::handle::{HandleError, HandleId, HandleManager, HandleRef};
use crate::resource::CommitRequest;

type CommitResult = Result<Option<PersistedSnapshot>, HandleError>;

pub(crate) struct CommitJob {
    pub(crate) manager: Arc<HandleManager>,
    pub(crate) id: HandleId,
    pub(crate) version: u64,
    pub(crate) stream: StreamId,
    pub(crate) dir: PathBuf,
    pub(crate) sync: bool,
    pub(crate) allow_delta: bool,
}

impl CommitJob {
    pub(crate) fn run(&self) -> CommitResult {
        let request = CommitRequest {
            version: self.version,
            stream: self.stream,
            from_cache: true,
            sync: self.sync,
            dir: &self.dir,
            allow_delta: self.allow_delta,
        };
        self.manager.commit(self.id, &request)
    }

    fn handle_ref(&self) -> HandleRef {
        HandleRef::new(self.manager.kind(), self.id)
    }
}

/// Receipt for one queued commit.
#[derive(Debug)]
pub struct CommitTicket {
    handle: HandleRef,
    version: u64,
    rx: oneshot::Receiver<CommitResult>,
}

impl CommitTicket {
    /// Handle being committed.
    #[must_use]
    pub fn handle(&self) -> HandleRef {
        self.handle
    }

    /// Version being committed.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Block until the commit finished.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// The commit's own error, or [`CheckpointError::CommitterStopped`] if
    /// the thread exited before acknowledging.
    pub fn wait(self) -> Result<Option<PersistedSnapshot>, CheckpointError> {
        match self.rx.blocking_recv() {
            Ok(result) => result.map_err(CheckpointError::from),
            Err(_) => Err(CheckpointError::CommitterStopped),
        }
    }
}

type Envelope = (CommitJob, oneshot::Sender<CommitResult>);

/// Owns the commit thread. Dropping it drains queued jobs and joins.
#[derive(Debug)]
pub struct Committer {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    thread: Option<JoinHandle<()>>,
}

impl Committer {
    /// Spawn the `vgpu-commit` thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn() -> Result<Self, CheckpointError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let thread = thread::Builder::new().name("vgpu-commit".into()).spawn(move || {
            let mut committed = 0u64;
            while let Some((job, ack)) = rx.blocking_recv() {
                let result = job.run();
                if let Err(e) = &result {
                    warn!(handle = %job.handle_ref(), version = job.version, error = %e, "background commit failed");
                } else {
                    committed += 1;
                }
                // The submitter may have stopped waiting.
                let _ = ack.send(result);
            }
            debug!(committed, "commit thread exiting");
        })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Queue `job`. A job the thread can no longer accept is handed back so
    /// the caller can run it inline.
    pub(crate) fn submit(&self, job: CommitJob) -> Result<CommitTicket, CommitJob> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(job);
        };
        let (ack, rx) = oneshot::channel();
        let handle = job.handle_ref();
        let version = job.version;
        match tx.send((job, ack)) {
            Ok(()) => Ok(CommitTicket { handle, version, rx }),
            Err(mpsc::error::SendError((job, _))) => Err(job),
        }
    }

    #[cfg(test)]
    pub(crate) fn stopped() -> Self {
        Self { tx: None, thread: None }
    }
}

impl Drop for Committer {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("commit thread panicked");
            }
        }
    }
}
