//! # Checkpointing
//!
//! Deciding when to checkpoint, and carrying it out.
//!
//! - [`policy`]: splices checkpoint nodes into a client's operation graph
//! - [`engine`]: executes those nodes (`add` on the stream, then `commit`)
//! - [`committer`]: background commit thread
//! - [`snapshot`]: on-disk snapshot format, full and delta
//! - [`graph`]: seams to the daemon's operation graph and manager registry

pub mod committer;
pub mod engine;
pub mod graph;
pub mod policy;
pub mod snapshot;

pub use committer::{CommitTicket, Committer};
pub use engine::{CheckpointEngine, CheckpointReport, EngineConfig, FlushReport};
pub use graph::{CheckpointScope, CheckpointTask, ManagerRegistry, OpKind, OpNode, OperationGraph};
pub use policy::{
    CheckpointMode, CheckpointPolicy, DisabledInsertion, IncrementalInsertion, InsertionStrategy, NaiveInsertion,
    CHECKPOINT_API_ID,
};

use crate::handle::HandleError;

/// Errors from checkpoint insertion and execution.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A handle operation failed.
    #[error("handle error: {0}")]
    Handle(#[from] HandleError),

    /// The operation graph refused a node.
    #[error("operation graph rejected node: {0}")]
    GraphRejected(String),

    /// The background commit thread is gone.
    #[error("commit thread stopped")]
    CommitterStopped,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
