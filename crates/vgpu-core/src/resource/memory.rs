//! Device memory allocation handles.

use super::{ResourceKind, ResourceType};

/// Capability implementation for [`ResourceKind::Memory`].
///
/// The only kind that benefits from pooling: rebuilding a large allocation
/// means a fresh device malloc plus a full state upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryType;

impl ResourceType for MemoryType {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn supports_pooling(&self) -> bool {
        true
    }
}
