//! Virtualized resource handles.
//!
//! A [`ResourceHandle`] stands in for one physical accelerator object. The
//! client only ever sees the handle's *client address*; the daemon keeps the
//! physical (server) address, the size of the device state behind it, its
//! dependency links and a [`CheckpointBag`](bag::CheckpointBag) of versioned
//! snapshots.
//!
//! ## Lifecycle
//!
//! ```text
//!            allocate                 fault / reset
//!   ───────────────────► Active ───────────────────► Broken
//!                          ▲                          │  restore()
//!                          └───────── Restoring ◄─────┘
//!
//!   Active | Broken ── tear_down() ──► TornDown (terminal)
//! ```
//!
//! Only the owning [`HandleManager`] changes a handle's status or physical
//! address; the mutators are private to this module tree.

pub mod addr;
pub mod bag;
mod manager;
pub mod pool;
pub mod record;
mod set;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::device::DeviceError;
use crate::resource::ResourceKind;

pub use bag::CheckpointBag;
pub use manager::{AllocateRequest, HandleManager, RelatedHandles, RestoreOutcome};
pub use set::{HandleResolver, ManagerSet};

/// A handle shared between its manager and the components that look it up.
pub type SharedHandle = Arc<Mutex<ResourceHandle>>;

/// Process-unique handle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out a fresh handle id.
pub(crate) fn next_handle_id() -> HandleId {
    HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Make sure ids handed out later never collide with `id`, e.g. one found
/// in a snapshot directory written by an earlier process.
pub fn observe_handle_id(id: HandleId) {
    NEXT_HANDLE_ID.fetch_max(id.0 + 1, Ordering::Relaxed);
}

/// Kind-qualified handle reference, the unit stored in dependency sets and
/// checkpoint nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleRef {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Handle id.
    pub id: HandleId,
}

impl HandleRef {
    /// Create a reference.
    #[must_use]
    pub const fn new(kind: ResourceKind, id: HandleId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Lifecycle status of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleStatus {
    /// Materialized and usable.
    Active,
    /// Backing resource lost.
    Broken,
    /// Being rebuilt.
    Restoring,
    /// Released. Terminal.
    TornDown,
}

impl fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Broken => write!(f, "Broken"),
            Self::Restoring => write!(f, "Restoring"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

/// Type-specific fields carried beyond the generic handle metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandleExtra {
    /// No extra fields.
    #[default]
    None,
    /// Device ordinal.
    Device {
        /// Ordinal of the accelerator.
        ordinal: i32,
    },
    /// Kernel function name.
    Function {
        /// Mangled kernel name.
        name: String,
    },
    /// Stream creation parameters.
    Stream {
        /// Scheduling priority.
        priority: i32,
        /// Creation flags.
        flags: u32,
    },
    /// Event creation flags.
    Event {
        /// Creation flags.
        flags: u32,
    },
}

impl HandleExtra {
    /// Error for extra fields handed to the wrong resource type.
    #[must_use]
    pub fn mismatch(&self, expected: ResourceKind) -> HandleError {
        HandleError::InvalidInput(format!("extra fields {self:?} do not belong to a {expected} handle"))
    }
}

/// Errors from handle allocation, checkpointing, restore and tear-down.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// Missing required related handle or malformed parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backing resource is gone or the handle is no longer usable.
    #[error("resource unavailable: {handle} is {status}")]
    ResourceUnavailable {
        /// The handle.
        handle: HandleRef,
        /// Its status at the time of the call.
        status: HandleStatus,
    },

    /// No virtual address range left for this kind.
    #[error("virtual address space exhausted for {kind}: requested {requested} bytes")]
    AddressSpaceExhausted {
        /// Kind whose space drained.
        kind: ResourceKind,
        /// Requested size.
        requested: u64,
    },

    /// No usable snapshot, or reloading it failed.
    #[error("restore failed for handle {id}: {reason}")]
    RestoreFailed {
        /// The handle.
        id: HandleId,
        /// Description of the failure.
        reason: String,
    },

    /// A file that should exist does not.
    #[error("not exist: {}", .0.display())]
    NotExist(PathBuf),

    /// The operation is blocked by dependents or a concurrent operation.
    #[error("resource busy: {handle}: {reason}")]
    ResourceBusy {
        /// The handle.
        handle: HandleRef,
        /// What is holding it.
        reason: String,
    },

    /// No handle with this id in the manager.
    #[error("handle not found: {0}")]
    NotFound(HandleRef),

    /// A checkpoint version was used out of order.
    #[error("version {version} conflict on handle {id}: {reason}")]
    VersionConflict {
        /// The handle.
        id: HandleId,
        /// Offending version.
        version: u64,
        /// Description of the conflict.
        reason: String,
    },

    /// Malformed snapshot file or serialized record.
    #[error("snapshot format error: {0}")]
    Snapshot(String),

    /// Device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One virtualized resource instance.
#[derive(Debug)]
pub struct ResourceHandle {
    id: HandleId,
    kind: ResourceKind,
    client_addr: u64,
    server_addr: Option<u64>,
    size: u64,
    state_size: u64,
    status: HandleStatus,
    parents: SmallVec<[HandleRef; 2]>,
    children: BTreeSet<HandleRef>,
    extra: HandleExtra,
    bag: CheckpointBag,
}

impl ResourceHandle {
    pub(in crate::handle) fn new(
        id: HandleId,
        kind: ResourceKind,
        client_addr: u64,
        size: u64,
        state_size: u64,
        extra: HandleExtra,
    ) -> Self {
        Self {
            id,
            kind,
            client_addr,
            server_addr: None,
            size,
            state_size,
            status: HandleStatus::Broken,
            parents: SmallVec::new(),
            children: BTreeSet::new(),
            extra,
            bag: CheckpointBag::new(id),
        }
    }

    /// Handle id.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Resource kind.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Kind-qualified reference to this handle.
    #[must_use]
    pub fn handle_ref(&self) -> HandleRef {
        HandleRef::new(self.kind, self.id)
    }

    /// Client-visible (mock) address.
    #[must_use]
    pub fn client_addr(&self) -> u64 {
        self.client_addr
    }

    /// Physical address, once materialized.
    #[must_use]
    pub fn server_addr(&self) -> Option<u64> {
        self.server_addr
    }

    /// Byte size of the handle's client-visible range.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Byte size of the device state this handle shadows.
    #[must_use]
    pub fn state_size(&self) -> u64 {
        self.state_size
    }

    /// Lifecycle status.
    #[must_use]
    pub fn status(&self) -> HandleStatus {
        self.status
    }

    /// Handles this one depends on.
    #[must_use]
    pub fn parents(&self) -> &[HandleRef] {
        &self.parents
    }

    /// Handles that depend on this one.
    #[must_use]
    pub fn children(&self) -> &BTreeSet<HandleRef> {
        &self.children
    }

    /// Type-specific extra fields.
    #[must_use]
    pub fn extra(&self) -> &HandleExtra {
        &self.extra
    }

    /// Checkpoint bag.
    #[must_use]
    pub fn bag(&self) -> &CheckpointBag {
        &self.bag
    }

    /// Whether `addr` falls inside this handle's client range.
    #[must_use]
    pub fn contains_client_addr(&self, addr: u64) -> bool {
        addr >= self.client_addr && addr - self.client_addr < self.size.max(1)
    }

    /// Fail unless the handle is `Active`.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::ResourceUnavailable`] for any other status.
    pub fn ensure_usable(&self) -> Result<(), HandleError> {
        if self.status == HandleStatus::Active {
            Ok(())
        } else {
            Err(self.unavailable())
        }
    }

    /// The physical address of an `Active` handle.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::ResourceUnavailable`] if the handle is not
    /// materialized.
    pub fn require_server_addr(&self) -> Result<u64, HandleError> {
        self.ensure_usable()?;
        self.server_addr.ok_or_else(|| self.unavailable())
    }

    pub(crate) fn unavailable(&self) -> HandleError {
        HandleError::ResourceUnavailable {
            handle: self.handle_ref(),
            status: self.status,
        }
    }

    pub(crate) fn bag_mut(&mut self) -> &mut CheckpointBag {
        &mut self.bag
    }

    pub(in crate::handle) fn set_status(&mut self, status: HandleStatus) {
        self.status = status;
    }

    pub(in crate::handle) fn set_server_addr(&mut self, addr: Option<u64>) {
        self.server_addr = addr;
    }

    pub(in crate::handle) fn record_parent(&mut self, parent: HandleRef) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    pub(in crate::handle) fn link_child(&mut self, child: HandleRef) {
        self.children.insert(child);
    }

    pub(in crate::handle) fn unlink_child(&mut self, child: HandleRef) {
        self.children.remove(&child);
    }
}
