//! Loaded code-module handles.

use super::{ResourceKind, ResourceType};

/// Capability implementation for [`ResourceKind::Module`].
///
/// The module image lives in a device buffer of `state_size` bytes, so the
/// default stateful add/commit/restore path applies unchanged. No extra fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleType;

impl ResourceType for ModuleType {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Module
    }
}
