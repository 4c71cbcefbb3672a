//! Per-client state: one device, one manager set, one operation queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use vgpu_core::checkpoint::{CheckpointError, OpNode, OperationGraph};
use vgpu_core::device::{Device, SimulatedDevice, StreamId};
use vgpu_core::handle::{HandleResolver, SharedHandle};
use vgpu_core::{HandleError, HandleRef, ManagerSet, ResourceKind};

use crate::error::DaemonError;

/// Device work a queued API node performs when executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Bookkeeping only.
    None,
    /// Host-to-device copy.
    Write {
        /// Destination handle.
        handle: HandleRef,
        /// Offset into the destination.
        offset: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Device-to-device copy.
    Copy {
        /// Destination handle.
        dst: HandleRef,
        /// Offset into the destination.
        dst_offset: u64,
        /// Source handle.
        src: HandleRef,
        /// Offset into the source.
        src_offset: u64,
        /// Bytes to copy.
        len: u64,
    },
    /// Device-to-host copy.
    Read {
        /// Source handle.
        handle: HandleRef,
        /// Offset into the source.
        offset: u64,
        /// Bytes to read.
        len: u64,
    },
    /// Release a handle.
    TearDown(HandleRef),
}

/// One queued node and its effect. Checkpoint nodes carry [`Effect::None`].
#[derive(Debug, Clone)]
pub struct QueuedOp {
    /// Graph node.
    pub node: OpNode,
    /// Work done when an API node runs.
    pub effect: Effect,
}

/// Bounded FIFO standing in for a client's operation graph.
#[derive(Debug)]
pub struct OpQueue {
    ops: Mutex<VecDeque<QueuedOp>>,
    capacity: usize,
}

impl OpQueue {
    /// Queue holding at most `capacity` nodes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Queued nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Whether `extra` more nodes would exceed the capacity.
    #[must_use]
    pub fn would_overflow(&self, extra: usize) -> bool {
        self.ops.lock().len() + extra > self.capacity
    }

    /// Copy of the queued nodes, oldest first.
    #[must_use]
    pub fn nodes(&self) -> Vec<OpNode> {
        self.ops.lock().iter().map(|op| op.node.clone()).collect()
    }

    /// Append `op`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::GraphRejected`] when the queue is full.
    pub fn push(&self, op: QueuedOp) -> Result<(), CheckpointError> {
        let mut ops = self.ops.lock();
        if ops.len() >= self.capacity {
            return Err(CheckpointError::GraphRejected(format!(
                "queue full ({} ops)",
                self.capacity
            )));
        }
        ops.push_back(op);
        Ok(())
    }

    pub(crate) fn take_all(&self) -> VecDeque<QueuedOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Put unexecuted ops back ahead of anything queued since.
    pub(crate) fn requeue_front(&self, mut rest: VecDeque<QueuedOp>) {
        let mut ops = self.ops.lock();
        rest.append(&mut ops);
        *ops = rest;
    }
}

impl OperationGraph for OpQueue {
    fn launch_op(&self, node: OpNode) -> Result<(), CheckpointError> {
        self.push(QueuedOp {
            node,
            effect: Effect::None,
        })
    }
}

/// A connected client.
#[derive(Debug)]
pub struct Client {
    id: u64,
    device: Arc<SimulatedDevice>,
    managers: ManagerSet,
    queue: OpQueue,
}

impl Client {
    /// Client with fresh managers on `device`. Baseline handles are created
    /// unless `is_restoring` is set.
    ///
    /// # Errors
    ///
    /// Propagates baseline allocation failures.
    pub fn new(id: u64, device: Arc<SimulatedDevice>, queue_capacity: usize, is_restoring: bool) -> Result<Self, DaemonError> {
        let managers = ManagerSet::with_default_types(Arc::clone(&device) as Arc<dyn Device>);
        managers.init_all(is_restoring)?;
        debug!(client_id = id, is_restoring, "client created");
        Ok(Self {
            id,
            device,
            managers,
            queue: OpQueue::new(queue_capacity),
        })
    }

    /// Client id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The client's device.
    #[must_use]
    pub fn device(&self) -> &Arc<SimulatedDevice> {
        &self.device
    }

    /// The client's handle managers.
    #[must_use]
    pub fn managers(&self) -> &ManagerSet {
        &self.managers
    }

    /// The client's operation queue.
    #[must_use]
    pub fn queue(&self) -> &OpQueue {
        &self.queue
    }

    /// Handle of `kind` whose client range contains `addr`, plus the offset.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::InvalidCall`] when nothing of that kind lives there.
    pub fn resolve_addr(&self, kind: ResourceKind, addr: u64) -> Result<(SharedHandle, u64), DaemonError> {
        self.managers
            .require_manager(kind)?
            .get_by_client_addr(addr)
            .ok_or_else(|| DaemonError::InvalidCall(format!("no {kind} at {addr:#x}")))
    }

    fn server_addr(&self, handle: HandleRef) -> Result<u64, DaemonError> {
        let shared = self.managers.resolve(handle).ok_or(HandleError::NotFound(handle))?;
        let h = shared.lock();
        h.ensure_usable()?;
        Ok(h.require_server_addr()?)
    }

    /// Perform `effect` on `stream`; reads return their bytes.
    ///
    /// # Errors
    ///
    /// Handle errors for unusable handles and device errors for bad ranges.
    pub fn apply(&self, effect: Effect, stream: StreamId) -> Result<Option<Vec<u8>>, DaemonError> {
        match effect {
            Effect::None => Ok(None),
            Effect::Write { handle, offset, data } => {
                let addr = self.server_addr(handle)?;
                self.device.write(addr, offset, &data, stream)?;
                Ok(None)
            }
            Effect::Copy {
                dst,
                dst_offset,
                src,
                src_offset,
                len,
            } => {
                let src_addr = self.server_addr(src)?;
                let dst_addr = self.server_addr(dst)?;
                let bytes = self.device.read(src_addr, src_offset, len, stream)?;
                self.device.write(dst_addr, dst_offset, &bytes, stream)?;
                Ok(None)
            }
            Effect::Read { handle, offset, len } => {
                let addr = self.server_addr(handle)?;
                let bytes = self.device.read(addr, offset, len, stream)?;
                self.device.synchronize(stream)?;
                Ok(Some(bytes))
            }
            Effect::TearDown(handle) => {
                self.managers.tear_down(handle)?;
                Ok(None)
            }
        }
    }
}
