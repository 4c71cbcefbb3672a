//! # vgpu Core
//!
//! Resource-handle virtualization and checkpoint/restore engine for the vgpu daemon.
//!
//! Clients see *virtual* resource addresses. The daemon maps each one to a
//! physical accelerator resource through a [`handle::ResourceHandle`], tracks
//! which handles were mutated since the last checkpoint, and can capture,
//! persist and later rebuild that state without replaying the client's call
//! history.
//!
//! This crate provides:
//! - **Handles**: lifecycle (`Active` / `Broken` / `Restoring` / `TornDown`),
//!   parent/child dependency links and the per-handle checkpoint bag
//! - **Handle managers**: per-type allocation, virtual address space, pooling,
//!   modified-set tracking and restore
//! - **Resource types**: one capability implementation per accelerator object
//! - **Checkpointing**: the add/commit engine, background committer, snapshot
//!   file codec and the checkpoint-insertion policy
//! - **Device**: the driver seam plus an in-memory simulated device
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vgpu_core::device::SimulatedDevice;
//! use vgpu_core::handle::{AllocateRequest, ManagerSet, RelatedHandles};
//! use vgpu_core::resource::ResourceKind;
//!
//! let device = Arc::new(SimulatedDevice::new(0, 1 << 30));
//! let managers = ManagerSet::with_default_types(device);
//! managers.init_all(false)?;
//!
//! let context = managers.primary(ResourceKind::Context).unwrap();
//! let related = RelatedHandles::new().with(ResourceKind::Context, context);
//! let buffer = managers
//!     .typed_manager(ResourceKind::Memory)?
//!     .allocate_mocked_resource(&related, AllocateRequest::stateful(4096))?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod device;
pub mod handle;
pub mod resource;

pub use checkpoint::{CheckpointEngine, CheckpointError, CheckpointMode, CheckpointPolicy};
pub use device::{Device, DeviceError, SimulatedDevice, StreamId};
pub use handle::{HandleError, HandleId, HandleManager, HandleRef, HandleStatus, ManagerSet};
pub use resource::{ResourceKind, ResourceType};

/// Result type for vgpu-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for vgpu-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device-level errors
    #[error("Device error: {0}")]
    Device(#[from] device::DeviceError),

    /// Handle lifecycle and manager errors
    #[error("Handle error: {0}")]
    Handle(#[from] handle::HandleError),

    /// Checkpoint engine and policy errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),
}
