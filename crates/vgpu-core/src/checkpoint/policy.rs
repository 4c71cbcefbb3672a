//! Checkpoint-insertion policy.
//!
//! Called once per queued client operation, after the operation itself was
//! queued. Depending on the configured [`CheckpointMode`] it appends zero or
//! one checkpoint node to the client's graph. It never touches the device;
//! capture happens when the graph executes the node.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::graph::{CheckpointScope, CheckpointTask, ManagerRegistry, OpNode, OperationGraph};
use super::CheckpointError;
use crate::handle::{HandleId, HandleManager, HandleRef};

/// API id used for checkpoint nodes unless overridden.
pub const CHECKPOINT_API_ID: u64 = 0xffff_0001;

/// Checkpoint insertion strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// No checkpoint insertion.
    Disabled,
    /// A full checkpoint after every operation.
    Naive,
    /// A checkpoint of exactly the modified handles, only when there are any.
    #[default]
    Incremental,
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Naive => write!(f, "naive"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// A strategy deciding whether to splice a checkpoint node after `op`.
pub trait InsertionStrategy: Send + Sync + fmt::Debug {
    /// Mode this strategy implements.
    fn mode(&self) -> CheckpointMode;

    /// Append zero or one checkpoint node after `op`; returns how many.
    ///
    /// # Errors
    ///
    /// Propagates graph rejection.
    fn insert(
        &self,
        op: &OpNode,
        checkpoint_api_id: u64,
        registry: &dyn ManagerRegistry,
        graph: &dyn OperationGraph,
    ) -> Result<usize, CheckpointError>;
}

/// Never inserts.
#[derive(Debug, Default)]
pub struct DisabledInsertion;

impl InsertionStrategy for DisabledInsertion {
    fn mode(&self) -> CheckpointMode {
        CheckpointMode::Disabled
    }

    fn insert(
        &self,
        _op: &OpNode,
        _checkpoint_api_id: u64,
        _registry: &dyn ManagerRegistry,
        _graph: &dyn OperationGraph,
    ) -> Result<usize, CheckpointError> {
        Ok(0)
    }
}

/// Full checkpoint after every operation.
///
/// Modified sets are drained too, so each checkpoint cycle clears them once.
#[derive(Debug, Default)]
pub struct NaiveInsertion;

impl InsertionStrategy for NaiveInsertion {
    fn mode(&self) -> CheckpointMode {
        CheckpointMode::Naive
    }

    fn insert(
        &self,
        op: &OpNode,
        checkpoint_api_id: u64,
        registry: &dyn ManagerRegistry,
        graph: &dyn OperationGraph,
    ) -> Result<usize, CheckpointError> {
        let taken = take_modified(registry);
        let task = CheckpointTask {
            scope: CheckpointScope::Full,
            stream: op.stream,
        };
        launch_or_restore(graph, OpNode::checkpoint(op.client_id, checkpoint_api_id, task), taken)?;
        Ok(1)
    }
}

/// Checkpoint of exactly the handles modified since the last cycle.
#[derive(Debug, Default)]
pub struct IncrementalInsertion;

impl InsertionStrategy for IncrementalInsertion {
    fn mode(&self) -> CheckpointMode {
        CheckpointMode::Incremental
    }

    fn insert(
        &self,
        op: &OpNode,
        checkpoint_api_id: u64,
        registry: &dyn ManagerRegistry,
        graph: &dyn OperationGraph,
    ) -> Result<usize, CheckpointError> {
        let taken = take_modified(registry);
        let handles: Vec<HandleRef> = taken
            .iter()
            .flat_map(|(manager, ids)| ids.iter().map(|id| HandleRef::new(manager.kind(), *id)))
            .collect();
        if handles.is_empty() {
            trace!(api_id = op.api_id, "no modified handles, no checkpoint");
            return Ok(0);
        }
        debug!(api_id = op.api_id, handles = handles.len(), "inserting incremental checkpoint");
        let task = CheckpointTask {
            scope: CheckpointScope::Handles(handles),
            stream: op.stream,
        };
        launch_or_restore(graph, OpNode::checkpoint(op.client_id, checkpoint_api_id, task), taken)?;
        Ok(1)
    }
}

type TakenSets = Vec<(Arc<HandleManager>, Vec<HandleId>)>;

fn take_modified(registry: &dyn ManagerRegistry) -> TakenSets {
    registry
        .stateful_kinds()
        .iter()
        .filter_map(|kind| registry.typed_manager(*kind))
        .map(|manager| {
            let ids = manager.take_modified_handles();
            (manager, ids)
        })
        .filter(|(_, ids)| !ids.is_empty())
        .collect()
}

fn launch_or_restore(graph: &dyn OperationGraph, node: OpNode, taken: TakenSets) -> Result<(), CheckpointError> {
    if let Err(e) = graph.launch_op(node) {
        for (manager, ids) in taken {
            manager.remark_modified(&ids);
        }
        return Err(e);
    }
    Ok(())
}

/// The entry point the graph builder calls once per queued operation.
#[derive(Debug)]
pub struct CheckpointPolicy {
    strategy: Box<dyn InsertionStrategy>,
    checkpoint_api_id: u64,
}

impl CheckpointPolicy {
    /// Policy using the built-in strategy for `mode`.
    #[must_use]
    pub fn new(mode: CheckpointMode) -> Self {
        let strategy: Box<dyn InsertionStrategy> = match mode {
            CheckpointMode::Disabled => Box::new(DisabledInsertion),
            CheckpointMode::Naive => Box::new(NaiveInsertion),
            CheckpointMode::Incremental => Box::new(IncrementalInsertion),
        };
        Self::with_strategy(strategy)
    }

    /// Policy using a custom strategy.
    #[must_use]
    pub fn with_strategy(strategy: Box<dyn InsertionStrategy>) -> Self {
        Self {
            strategy,
            checkpoint_api_id: CHECKPOINT_API_ID,
        }
    }

    /// Override the API id stamped on checkpoint nodes.
    #[must_use]
    pub fn with_checkpoint_api_id(mut self, api_id: u64) -> Self {
        self.checkpoint_api_id = api_id;
        self
    }

    /// Active mode.
    #[must_use]
    pub fn mode(&self) -> CheckpointMode {
        self.strategy.mode()
    }

    /// API id stamped on checkpoint nodes.
    #[must_use]
    pub fn checkpoint_api_id(&self) -> u64 {
        self.checkpoint_api_id
    }

    /// Decide whether to append a checkpoint node after `op`; returns how
    /// many nodes were appended (0 or 1).
    ///
    /// Checkpoint nodes themselves never trigger insertion.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::GraphRejected`] if the graph refuses the
    /// node; any modified markers taken for it are put back.
    pub fn checkpoint_insertion(
        &self,
        op: &OpNode,
        registry: &dyn ManagerRegistry,
        graph: &dyn OperationGraph,
    ) -> Result<usize, CheckpointError> {
        if op.is_checkpoint() {
            return Ok(0);
        }
        self.strategy.insert(op, self.checkpoint_api_id, registry, graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use crate::handle::{AllocateRequest, ManagerSet, RelatedHandles};
    use crate::resource::ResourceKind;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingGraph {
        nodes: Mutex<Vec<OpNode>>,
        reject: bool,
    }

    impl OperationGraph for RecordingGraph {
        fn launch_op(&self, node: OpNode) -> Result<(), CheckpointError> {
            if self.reject {
                return Err(CheckpointError::GraphRejected("queue closed".into()));
            }
            self.nodes.lock().push(node);
            Ok(())
        }
    }

    fn setup() -> (ManagerSet, HandleRef) {
        let set = ManagerSet::with_default_types(Arc::new(SimulatedDevice::new(0, 1 << 20)));
        set.init_all(false).unwrap();
        let related = RelatedHandles::new().with(ResourceKind::Context, set.primary(ResourceKind::Context).unwrap());
        let h = set
            .manager(ResourceKind::Memory)
            .unwrap()
            .allocate_mocked_resource(&related, AllocateRequest::stateful(256))
            .unwrap();
        let r = h.lock().handle_ref();
        (set, r)
    }

    #[test]
    fn test_incremental_nothing_modified() {
        let (set, _) = setup();
        let graph = RecordingGraph::default();
        let policy = CheckpointPolicy::new(CheckpointMode::Incremental);
        assert_eq!(policy.checkpoint_insertion(&OpNode::api(1, 10), &set, &graph).unwrap(), 0);
        assert!(graph.nodes.lock().is_empty());
    }

    #[test]
    fn test_incremental_tags_exactly_modified() {
        let (set, r) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        mem.mark_modified(r.id).unwrap();

        let graph = RecordingGraph::default();
        let policy = CheckpointPolicy::new(CheckpointMode::Incremental);
        assert_eq!(policy.checkpoint_insertion(&OpNode::api(1, 10).on_stream(3), &set, &graph).unwrap(), 1);

        let nodes = graph.nodes.lock();
        let task = nodes[0].checkpoint_task().unwrap();
        assert_eq!(task.scope, CheckpointScope::Handles(vec![r]));
        assert_eq!(task.stream, 3);
        assert_eq!(nodes[0].api_id, CHECKPOINT_API_ID);
        assert!(mem.get_modified_handles().is_empty());
    }

    #[test]
    fn test_rejected_launch_keeps_markers() {
        let (set, r) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        mem.mark_modified(r.id).unwrap();

        let graph = RecordingGraph {
            reject: true,
            ..RecordingGraph::default()
        };
        let policy = CheckpointPolicy::new(CheckpointMode::Incremental);
        assert!(policy.checkpoint_insertion(&OpNode::api(1, 10), &set, &graph).is_err());
        assert_eq!(mem.get_modified_handles(), vec![r.id]);
    }

    #[test]
    fn test_naive_always_inserts_full() {
        let (set, r) = setup();
        set.manager(ResourceKind::Memory).unwrap().mark_modified(r.id).unwrap();
        let graph = RecordingGraph::default();
        let policy = CheckpointPolicy::new(CheckpointMode::Naive);
        for _ in 0..3 {
            assert_eq!(policy.checkpoint_insertion(&OpNode::api(1, 10), &set, &graph).unwrap(), 1);
        }
        let nodes = graph.nodes.lock();
        assert_eq!(nodes.len(), 3);
        assert!(nodes
            .iter()
            .all(|n| n.checkpoint_task().map(|t| &t.scope) == Some(&CheckpointScope::Full)));
        assert!(set.manager(ResourceKind::Memory).unwrap().get_modified_handles().is_empty());
    }

    #[test]
    fn test_disabled_and_checkpoint_nodes_insert_nothing() {
        let (set, r) = setup();
        set.manager(ResourceKind::Memory).unwrap().mark_modified(r.id).unwrap();
        let graph = RecordingGraph::default();

        let disabled = CheckpointPolicy::new(CheckpointMode::Disabled);
        assert_eq!(disabled.checkpoint_insertion(&OpNode::api(1, 10), &set, &graph).unwrap(), 0);

        let incremental = CheckpointPolicy::new(CheckpointMode::Incremental);
        let ckpt = OpNode::checkpoint(
            1,
            CHECKPOINT_API_ID,
            CheckpointTask {
                scope: CheckpointScope::Full,
                stream: 0,
            },
        );
        assert_eq!(incremental.checkpoint_insertion(&ckpt, &set, &graph).unwrap(), 0);
        assert!(graph.nodes.lock().is_empty());
        assert_eq!(set.manager(ResourceKind::Memory).unwrap().get_modified_handles(), vec![r.id]);
    }
}
