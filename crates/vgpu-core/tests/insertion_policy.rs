//! Incremental checkpoint insertion feeding the engine through a recording graph.

use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use vgpu_core::checkpoint::{
    CheckpointError, CheckpointMode, CheckpointPolicy, CheckpointScope, EngineConfig, OpNode, OperationGraph,
};
use vgpu_core::device::{Device, SimulatedDevice};
use vgpu_core::handle::{AllocateRequest, RelatedHandles};
use vgpu_core::{CheckpointEngine, ManagerSet, ResourceKind};

#[derive(Default)]
struct RecordingGraph {
    nodes: Mutex<Vec<OpNode>>,
}

impl OperationGraph for RecordingGraph {
    fn launch_op(&self, node: OpNode) -> Result<(), CheckpointError> {
        self.nodes.lock().push(node);
        Ok(())
    }
}

#[test]
fn test_modified_memory_is_checkpointed_once() {
    let dir = TempDir::new().unwrap();
    let dev = Arc::new(SimulatedDevice::new(0, 1 << 20));
    let set = ManagerSet::with_default_types(Arc::clone(&dev) as Arc<dyn Device>);
    set.init_all(false).unwrap();
    let related = RelatedHandles::new().with(ResourceKind::Context, set.primary(ResourceKind::Context).unwrap());
    let mem = set.manager(ResourceKind::Memory).unwrap();
    let buf = mem.allocate_mocked_resource(&related, AllocateRequest::stateful(1024)).unwrap();
    let r = buf.lock().handle_ref();

    let graph = RecordingGraph::default();
    let policy = CheckpointPolicy::new(CheckpointMode::Incremental);
    let engine = CheckpointEngine::new(EngineConfig::new(dir.path())).unwrap();

    mem.mark_modified(r.id).unwrap();
    assert_eq!(policy.checkpoint_insertion(&OpNode::api(7, 1), &set, &graph).unwrap(), 1);
    assert_eq!(policy.checkpoint_insertion(&OpNode::api(7, 2), &set, &graph).unwrap(), 0);

    let nodes = std::mem::take(&mut *graph.nodes.lock());
    assert_eq!(nodes.len(), 1);
    let task = nodes[0].checkpoint_task().unwrap();
    assert_eq!(task.scope, CheckpointScope::Handles(vec![r]));

    let report = engine.execute(&set, task).unwrap();
    assert_eq!(report.captured, 1);
    let flushed = engine.flush().unwrap();
    assert_eq!(flushed.committed, 1);
    assert!(buf.lock().bag().is_committed(report.version));
    assert!(mem.get_modified_handles().is_empty());

    mem.clear_modified_handles();
    mem.clear_modified_handles();
    assert!(mem.get_modified_handles().is_empty());
}
