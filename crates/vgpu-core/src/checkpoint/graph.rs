//! Operation-graph seam.
//!
//! The checkpoint policy never owns a client's operation graph; it only hands
//! nodes to an [`OperationGraph`] and looks managers up through a
//! [`ManagerRegistry`]. Both are implemented by the daemon.

use std::sync::Arc;

use super::CheckpointError;
use crate::device::{StreamId, DEFAULT_STREAM};
use crate::handle::{HandleManager, HandleRef};
use crate::resource::ResourceKind;

/// Which handles a checkpoint node captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointScope {
    /// Every live handle of every stateful kind.
    Full,
    /// Exactly these handles.
    Handles(Vec<HandleRef>),
}

/// Work carried by a checkpoint node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointTask {
    /// Handles to capture.
    pub scope: CheckpointScope,
    /// Stream whose preceding work the capture must observe.
    pub stream: StreamId,
}

/// What a node does when the graph executes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// A client API call.
    Api,
    /// A checkpoint spliced in by the insertion policy.
    Checkpoint(CheckpointTask),
}

/// One element of a client's operation graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpNode {
    /// Owning client.
    pub client_id: u64,
    /// API identifier.
    pub api_id: u64,
    /// Stream the operation is ordered on.
    pub stream: StreamId,
    /// Node kind.
    pub kind: OpKind,
}

impl OpNode {
    /// A client API node on the default stream.
    #[must_use]
    pub fn api(client_id: u64, api_id: u64) -> Self {
        Self {
            client_id,
            api_id,
            stream: DEFAULT_STREAM,
            kind: OpKind::Api,
        }
    }

    /// Same node, ordered on `stream`.
    #[must_use]
    pub fn on_stream(mut self, stream: StreamId) -> Self {
        self.stream = stream;
        self
    }

    /// A checkpoint node.
    #[must_use]
    pub fn checkpoint(client_id: u64, api_id: u64, task: CheckpointTask) -> Self {
        Self {
            client_id,
            api_id,
            stream: task.stream,
            kind: OpKind::Checkpoint(task),
        }
    }

    /// Whether this is a checkpoint node.
    #[must_use]
    pub fn is_checkpoint(&self) -> bool {
        matches!(self.kind, OpKind::Checkpoint(_))
    }

    /// The checkpoint task, if any.
    #[must_use]
    pub fn checkpoint_task(&self) -> Option<&CheckpointTask> {
        match &self.kind {
            OpKind::Checkpoint(task) => Some(task),
            OpKind::Api => None,
        }
    }
}

/// A client's operation graph, as seen by the checkpoint policy.
pub trait OperationGraph: Send + Sync {
    /// Enqueue `node`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::GraphRejected`] if the graph refuses the node.
    fn launch_op(&self, node: OpNode) -> Result<(), CheckpointError>;
}

/// Per-client manager lookup.
pub trait ManagerRegistry: Send + Sync {
    /// Kinds whose handles shadow device state, enumerated once per client.
    fn stateful_kinds(&self) -> &[ResourceKind];

    /// The manager for `kind`.
    fn typed_manager(&self, kind: ResourceKind) -> Option<Arc<HandleManager>>;
}
