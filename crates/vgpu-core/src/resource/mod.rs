//! Resource kinds and the per-kind capability interface.
//!
//! Every accelerator object the daemon virtualizes belongs to exactly one
//! [`ResourceKind`]. The behaviour that differs between kinds (how the physical
//! object is created, whether it carries device state, which extra fields go
//! into a handle record) lives behind the [`ResourceType`] trait; the generic
//! handle and manager code never matches on the kind itself.
//!
//! ```text
//! Device ─► Context ─┬─► Module ─► Function
//!                    ├─► Memory
//!                    ├─► Stream
//!                    └─► Event
//! ```

mod context;
mod device;
mod event;
mod function;
mod memory;
mod module;
mod stream;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::checkpoint::snapshot;
use crate::device::{Device, StreamId};
use crate::handle::bag::{DeviceSnapshot, PersistedSnapshot};
use crate::handle::{HandleError, HandleExtra, HandleRef, ResourceHandle};

pub use context::ContextType;
pub use device::DeviceType;
pub use event::EventType;
pub use function::FunctionType;
pub use memory::MemoryType;
pub use module::ModuleType;
pub use stream::StreamType;

/// Default byte size recorded for handles that do not map a client buffer.
pub const DEFAULT_HANDLE_SIZE: u64 = 1;

/// Closed set of virtualized accelerator resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A physical accelerator.
    Device,
    /// An execution context bound to one device.
    Context,
    /// A loaded code module (its image is device state).
    Module,
    /// A kernel function resolved from a module.
    Function,
    /// A device memory allocation.
    Memory,
    /// An execution stream.
    Stream,
    /// A synchronization event.
    Event,
}

impl ResourceKind {
    /// All kinds in dependency order.
    pub const ALL: [ResourceKind; 7] = [
        Self::Device,
        Self::Context,
        Self::Module,
        Self::Function,
        Self::Memory,
        Self::Stream,
        Self::Event,
    ];

    /// Stable numeric id used in serialized handle records.
    #[must_use]
    pub const fn type_id(self) -> u16 {
        match self {
            Self::Device => 1,
            Self::Context => 2,
            Self::Module => 3,
            Self::Function => 4,
            Self::Memory => 5,
            Self::Stream => 6,
            Self::Event => 7,
        }
    }

    /// Inverse of [`type_id`](Self::type_id).
    #[must_use]
    pub fn from_type_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_id() == id)
    }

    /// Position in restore order. Kinds with no dependencies come first.
    #[must_use]
    pub const fn dependency_rank(self) -> u8 {
        match self {
            Self::Device => 0,
            Self::Context => 1,
            Self::Module => 2,
            Self::Function => 3,
            Self::Memory => 4,
            Self::Stream => 5,
            Self::Event => 6,
        }
    }

    /// Whether handles of this kind shadow device-resident state.
    #[must_use]
    pub const fn is_stateful(self) -> bool {
        matches!(self, Self::Module | Self::Memory)
    }

    /// Kinds whose handle must be supplied when allocating a handle of this kind.
    #[must_use]
    pub const fn required_parents(self) -> &'static [ResourceKind] {
        match self {
            Self::Device => &[],
            Self::Context => &[Self::Device],
            Self::Function => &[Self::Module],
            Self::Module | Self::Memory | Self::Stream | Self::Event => &[Self::Context],
        }
    }

    /// Human-readable resource name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Context => "context",
            Self::Module => "module",
            Self::Function => "function",
            Self::Memory => "memory",
            Self::Stream => "stream",
            Self::Event => "event",
        }
    }

    /// Build the default capability implementation for this kind.
    #[must_use]
    pub fn default_type(self) -> Arc<dyn ResourceType> {
        match self {
            Self::Device => Arc::new(DeviceType::default()),
            Self::Context => Arc::new(ContextType),
            Self::Module => Arc::new(ModuleType),
            Self::Function => Arc::new(FunctionType),
            Self::Memory => Arc::new(MemoryType),
            Self::Stream => Arc::new(StreamType),
            Self::Event => Arc::new(EventType),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A baseline handle a manager creates during `init`.
#[derive(Debug, Clone)]
pub struct BaselineHandle {
    /// Kinds of parent to bind (the manager picks the primary handle of each).
    pub parents: &'static [ResourceKind],
    /// Type-specific extra fields.
    pub extra: HandleExtra,
}

/// Parameters of a commit request.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    /// Version being committed.
    pub version: u64,
    /// Stream used to read live state when not committing from cache.
    pub stream: StreamId,
    /// Flush the snapshot staged by `add` instead of reading the live resource.
    pub from_cache: bool,
    /// Block until the file is durable.
    pub sync: bool,
    /// Directory receiving snapshot files.
    pub dir: &'a std::path::Path,
    /// Allow delta encoding against the previous committed image.
    pub allow_delta: bool,
}

/// Owned description of everything needed to rebuild one handle.
///
/// Built by the manager while holding the handle lock, then executed without
/// it so a concurrent restore request observes `Restoring` instead of waiting.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// Handle being rebuilt.
    pub handle: HandleRef,
    /// Size of the device state behind the handle.
    pub state_size: u64,
    /// Type-specific extra fields.
    pub extra: HandleExtra,
    /// Newest full snapshot followed by every later delta.
    pub chain: Vec<PersistedSnapshot>,
    /// Newer device-resident snapshot that survived the fault, if any.
    pub buffered: Option<DeviceSnapshot>,
}

/// Capability interface every resource kind implements.
///
/// Default methods cover stateless kinds and the common stateful path (state
/// lives in a device buffer at the handle's physical address). Kinds override
/// only what differs.
pub trait ResourceType: Send + Sync + fmt::Debug {
    /// The kind this implementation serves.
    fn kind(&self) -> ResourceKind;

    /// Create the physical resource and return its address.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Device`] if the device refuses the allocation.
    fn materialize(
        &self,
        device: &dyn Device,
        state_size: u64,
        _extra: &HandleExtra,
    ) -> Result<u64, HandleError> {
        if self.kind().is_stateful() {
            Ok(device.malloc(state_size)?)
        } else {
            Ok(device.create_object()?)
        }
    }

    /// Release the physical resource at `server_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Device`] if the device reports a failure.
    fn release(&self, device: &dyn Device, server_addr: u64) -> Result<(), HandleError> {
        if self.kind().is_stateful() {
            device.free(server_addr)?;
        } else {
            device.destroy_object(server_addr)?;
        }
        Ok(())
    }

    /// Capture device state into a staging buffer in the handle's bag.
    ///
    /// Synchronizes `stream` first so the captured bytes reflect every
    /// preceding operation on it.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::ResourceUnavailable`] for a handle that is not
    /// `Active`, or a device/version error.
    fn add(
        &self,
        device: &dyn Device,
        handle: &mut ResourceHandle,
        version: u64,
        stream: StreamId,
    ) -> Result<(), HandleError> {
        handle.ensure_usable()?;
        if handle.state_size() == 0 {
            return Ok(());
        }
        let server_addr = handle.require_server_addr()?;
        device.synchronize(stream)?;
        let staging = device.malloc(handle.state_size())?;
        if let Err(e) = device.copy(staging, server_addr, handle.state_size(), stream) {
            free_staging(device, handle.handle_ref(), staging);
            return Err(e.into());
        }
        let snapshot = DeviceSnapshot {
            version,
            addr: staging,
            len: handle.state_size(),
        };
        match handle.bag_mut().stage(snapshot) {
            Ok(Some(replaced)) => device.free(replaced.addr)?,
            Ok(None) => {}
            Err(e) => {
                free_staging(device, handle.handle_ref(), staging);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Flush the state for `request.version` to a snapshot file.
    ///
    /// Returns `None` for kinds without device state.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::VersionConflict`] when the version was already
    /// committed or `from_cache` is set without a matching `add`, and
    /// I/O or device errors otherwise.
    fn commit(
        &self,
        device: &dyn Device,
        handle: &mut ResourceHandle,
        request: &CommitRequest<'_>,
    ) -> Result<Option<PersistedSnapshot>, HandleError> {
        if handle.state_size() == 0 {
            return Ok(None);
        }
        let id = handle.id();
        if handle.bag().is_committed(request.version) {
            return Err(HandleError::VersionConflict {
                id,
                version: request.version,
                reason: "version already committed".into(),
            });
        }
        if handle.bag().is_stale(request.version) {
            if let Some(staged) = handle.bag_mut().take_staged(request.version) {
                free_staging(device, handle.handle_ref(), staged.addr);
            }
            return Err(HandleError::VersionConflict {
                id,
                version: request.version,
                reason: "version is older than the latest commit".into(),
            });
        }
        if !handle.bag().has_added(request.version) {
            return Err(HandleError::VersionConflict {
                id,
                version: request.version,
                reason: "commit issued before add".into(),
            });
        }
        let state = if request.from_cache {
            let staged = handle.bag_mut().take_staged(request.version).ok_or_else(|| {
                HandleError::VersionConflict {
                    id,
                    version: request.version,
                    reason: "commit from cache without a completed add".into(),
                }
            })?;
            let bytes = device.read(staged.addr, 0, staged.len, request.stream);
            device.free(staged.addr)?;
            bytes?
        } else {
            let server_addr = handle.require_server_addr()?;
            if let Some(staged) = handle.bag_mut().take_staged(request.version) {
                device.free(staged.addr)?;
            }
            device.synchronize(request.stream)?;
            device.read(server_addr, 0, handle.state_size(), request.stream)?
        };

        let delta_encoded = handle
            .bag()
            .host_image()
            .filter(|_| request.allow_delta)
            .and_then(|base| snapshot::encode_delta(id, request.version, base, &state));
        let (encoded, delta) = match delta_encoded {
            Some(bytes) => (bytes, true),
            None => (snapshot::encode_full(id, request.version, &state), false),
        };
        let path = snapshot::write_snapshot(request.dir, id, request.version, &encoded, request.sync)?;
        let persisted = PersistedSnapshot {
            version: request.version,
            path,
            delta,
            len: encoded.len() as u64,
        };
        let retired = handle.bag_mut().record_persisted(persisted.clone())?;
        for staged in retired {
            free_staging(device, handle.handle_ref(), staged.addr);
        }
        handle
            .bag_mut()
            .set_host_image(request.allow_delta.then(|| state.into()));
        Ok(Some(persisted))
    }

    /// Rebuild the physical resource described by `plan` and return its address.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::RestoreFailed`] when no usable snapshot exists
    /// or replaying it fails. The partially built resource is released.
    fn restore(&self, device: &dyn Device, plan: &RestorePlan, stream: StreamId) -> Result<u64, HandleError> {
        let server_addr = self.materialize(device, plan.state_size, &plan.extra)?;
        if plan.state_size == 0 {
            return Ok(server_addr);
        }
        let replayed = replay_state(self, device, plan, server_addr, stream);
        if let Err(e) = replayed {
            if let Err(release) = self.release(device, server_addr) {
                warn!(handle = %plan.handle, error = %release, "failed to release partially restored resource");
            }
            return Err(match e {
                HandleError::RestoreFailed { .. } => e,
                other => HandleError::RestoreFailed {
                    id: plan.handle.id,
                    reason: other.to_string(),
                },
            });
        }
        Ok(server_addr)
    }

    /// Push `data` back onto the device at `server_addr + offset`.
    ///
    /// When `on_device` is set, `data` is ignored and `device_src` names a
    /// device buffer to copy from instead.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Device`] on out-of-bounds or lost buffers.
    fn reload_state(
        &self,
        device: &dyn Device,
        server_addr: u64,
        data: ReloadSource<'_>,
        offset: u64,
        stream: StreamId,
    ) -> Result<(), HandleError> {
        match data {
            ReloadSource::Host(bytes) => device.write(server_addr, offset, bytes, stream)?,
            ReloadSource::Device { addr, len } => {
                if offset != 0 {
                    return Err(HandleError::InvalidInput(
                        "device-resident reload must start at offset 0".into(),
                    ));
                }
                device.copy(server_addr, addr, len, stream)?;
            }
        }
        device.synchronize(stream)?;
        Ok(())
    }

    /// Serialized size of the type-specific extra fields.
    fn extra_serialize_size(&self, _extra: &HandleExtra) -> usize {
        0
    }

    /// Append the type-specific extra fields to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::InvalidInput`] if `extra` belongs to another kind.
    fn serialize_extra(&self, _extra: &HandleExtra, _out: &mut bytes::BytesMut) -> Result<(), HandleError> {
        Ok(())
    }

    /// Decode the extra fields written by [`serialize_extra`](Self::serialize_extra).
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Snapshot`] on a truncated or malformed block.
    fn deserialize_extra(&self, _raw: &[u8]) -> Result<HandleExtra, HandleError> {
        Ok(HandleExtra::None)
    }

    /// Whether pre-restoring handles into a pool pays off for this kind.
    fn supports_pooling(&self) -> bool {
        false
    }

    /// Handles the manager pre-creates during a non-restoring `init`.
    fn baseline_handles(&self) -> Vec<BaselineHandle> {
        Vec::new()
    }
}

/// Source of bytes for [`ResourceType::reload_state`].
#[derive(Debug, Clone, Copy)]
pub enum ReloadSource<'a> {
    /// Bytes in host memory.
    Host(&'a [u8]),
    /// A device-resident buffer.
    Device {
        /// Buffer address.
        addr: u64,
        /// Bytes to copy.
        len: u64,
    },
}

fn free_staging(device: &dyn Device, handle: HandleRef, addr: u64) {
    if device.is_alive(addr) {
        if let Err(e) = device.free(addr) {
            warn!(%handle, error = %e, "failed to free staging buffer");
        }
    }
}

fn replay_state<T: ResourceType + ?Sized>(
    ty: &T,
    device: &dyn Device,
    plan: &RestorePlan,
    server_addr: u64,
    stream: StreamId,
) -> Result<(), HandleError> {
    let persisted_version = plan.chain.last().map(|s| s.version);
    if let Some(buffered) = plan
        .buffered
        .filter(|b| persisted_version.map_or(true, |v| b.version > v) && device.is_alive(b.addr))
    {
        return ty.reload_state(
            device,
            server_addr,
            ReloadSource::Device {
                addr: buffered.addr,
                len: buffered.len,
            },
            0,
            stream,
        );
    }

    if plan.chain.is_empty() {
        return Err(HandleError::RestoreFailed {
            id: plan.handle.id,
            reason: "no usable snapshot".into(),
        });
    }
    let image = snapshot::replay_chain(plan.handle.id, plan.state_size, &plan.chain)?;
    ty.reload_state(device, server_addr, ReloadSource::Host(&image), 0, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_roundtrip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_type_id(kind.type_id()), Some(kind));
        }
        assert_eq!(ResourceKind::from_type_id(0), None);
    }

    #[test]
    fn test_dependency_order_is_sorted() {
        let ranks: Vec<u8> = ResourceKind::ALL.iter().map(|k| k.dependency_rank()).collect();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        assert_eq!(ranks, sorted);
        for kind in ResourceKind::ALL {
            for parent in kind.required_parents() {
                assert!(parent.dependency_rank() < kind.dependency_rank());
            }
        }
    }

    #[test]
    fn test_stateful_kinds() {
        let stateful: Vec<_> = ResourceKind::ALL.into_iter().filter(|k| k.is_stateful()).collect();
        assert_eq!(stateful, vec![ResourceKind::Module, ResourceKind::Memory]);
    }

    #[test]
    fn test_default_type_matches_kind() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.default_type().kind(), kind);
        }
    }
}
