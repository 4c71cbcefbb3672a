//! Execution context handles.

use super::{BaselineHandle, ResourceKind, ResourceType};
use crate::handle::HandleExtra;

/// Capability implementation for [`ResourceKind::Context`].
///
/// Stateless with no extra fields. The manager creates the primary context of
/// the device during a non-restoring `init`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextType;

impl ResourceType for ContextType {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Context
    }

    fn baseline_handles(&self) -> Vec<BaselineHandle> {
        vec![BaselineHandle {
            parents: &[ResourceKind::Device],
            extra: HandleExtra::None,
        }]
    }
}
