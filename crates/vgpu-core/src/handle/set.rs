//! The full set of per-kind managers belonging to one client.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::manager::{HandleManager, RelatedHandles};
use super::{HandleError, HandleRef, HandleStatus, SharedHandle};
use crate::checkpoint::ManagerRegistry;
use crate::device::Device;
use crate::resource::{ResourceKind, ResourceType};

/// Resolves a kind-qualified reference to a handle, across managers.
pub trait HandleResolver {
    /// Look up `handle`.
    fn resolve(&self, handle: HandleRef) -> Option<SharedHandle>;
}

/// One [`HandleManager`] per resource kind, plus the client's stateful-kind list.
#[derive(Debug)]
pub struct ManagerSet {
    device: Arc<dyn Device>,
    managers: BTreeMap<ResourceKind, Arc<HandleManager>>,
    stateful: Vec<ResourceKind>,
}

impl ManagerSet {
    /// Managers for every kind using the default resource types.
    #[must_use]
    pub fn with_default_types(device: Arc<dyn Device>) -> Self {
        let ordinal = device.ordinal();
        let types = ResourceKind::ALL.into_iter().map(|kind| match kind {
            ResourceKind::Device => Arc::new(crate::resource::DeviceType::new(ordinal)) as Arc<dyn ResourceType>,
            other => other.default_type(),
        });
        Self::with_types(device, types)
    }

    /// Managers for the given resource types. A later type for the same kind
    /// replaces an earlier one.
    pub fn with_types(device: Arc<dyn Device>, types: impl IntoIterator<Item = Arc<dyn ResourceType>>) -> Self {
        let managers: BTreeMap<ResourceKind, Arc<HandleManager>> = types
            .into_iter()
            .map(|ty| (ty.kind(), Arc::new(HandleManager::new(ty, Arc::clone(&device)))))
            .collect();
        let stateful = managers.keys().copied().filter(|k| k.is_stateful()).collect();
        Self {
            device,
            managers,
            stateful,
        }
    }

    /// The device every manager materializes on.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Manager for `kind`.
    #[must_use]
    pub fn manager(&self, kind: ResourceKind) -> Option<&Arc<HandleManager>> {
        self.managers.get(&kind)
    }

    /// Manager for `kind`, as an error when missing.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::InvalidInput`] when no manager serves `kind`.
    pub fn require_manager(&self, kind: ResourceKind) -> Result<&Arc<HandleManager>, HandleError> {
        self.manager(kind)
            .ok_or_else(|| HandleError::InvalidInput(format!("no manager for {kind}")))
    }

    /// Managers in dependency order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<HandleManager>> {
        self.managers.values()
    }

    /// Run every manager's `init` in dependency order, feeding each the primary
    /// handle of the kinds already initialized.
    ///
    /// # Errors
    ///
    /// Propagates the first allocation failure.
    pub fn init_all(&self, is_restoring: bool) -> Result<(), HandleError> {
        let mut related = RelatedHandles::new();
        for manager in self.managers.values() {
            manager.init(&related, is_restoring)?;
            if let Some(primary) = self.primary(manager.kind()) {
                related.insert(manager.kind(), primary);
            }
        }
        Ok(())
    }

    /// Lowest-id `Active` handle of `kind`, e.g. the primary context or the
    /// default stream.
    #[must_use]
    pub fn primary(&self, kind: ResourceKind) -> Option<SharedHandle> {
        let manager = self.manager(kind)?;
        let id = manager.ids_with_status(HandleStatus::Active).into_iter().next()?;
        manager.get(id)
    }

    /// Tear down one handle through its manager.
    ///
    /// # Errors
    ///
    /// See [`HandleManager::tear_down`].
    pub fn tear_down(&self, handle: HandleRef) -> Result<(), HandleError> {
        self.require_manager(handle.kind)?.tear_down(handle.id, self)
    }

    /// Tear down every handle, dependents first.
    ///
    /// # Errors
    ///
    /// Propagates the first tear-down failure.
    pub fn tear_down_all(&self) -> Result<usize, HandleError> {
        let mut count = 0;
        for manager in self.managers.values().rev() {
            for shared in manager.handles().into_iter().rev() {
                let id = shared.lock().id();
                manager.tear_down(id, self)?;
                count += 1;
            }
        }
        debug!(count, "tore down all handles");
        Ok(count)
    }

    /// Mark every `Active` handle `Broken`.
    ///
    /// # Errors
    ///
    /// Propagates release failures.
    pub fn mark_all_broken(&self) -> Result<usize, HandleError> {
        let mut count = 0;
        for manager in self.managers.values() {
            count += manager.mark_all_broken()?;
        }
        Ok(count)
    }

    /// Count of handles per status across all managers.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<ResourceKind, [usize; 4]> {
        self.managers
            .iter()
            .map(|(kind, m)| {
                let mut counts = [0usize; 4];
                for h in m.handles() {
                    let slot = match h.lock().status() {
                        HandleStatus::Active => 0,
                        HandleStatus::Broken => 1,
                        HandleStatus::Restoring => 2,
                        HandleStatus::TornDown => 3,
                    };
                    counts[slot] += 1;
                }
                (*kind, counts)
            })
            .collect()
    }
}

impl HandleResolver for ManagerSet {
    fn resolve(&self, handle: HandleRef) -> Option<SharedHandle> {
        self.manager(handle.kind)?.get(handle.id)
    }
}

impl ManagerRegistry for ManagerSet {
    fn stateful_kinds(&self) -> &[ResourceKind] {
        &self.stateful
    }

    fn typed_manager(&self, kind: ResourceKind) -> Option<Arc<HandleManager>> {
        self.manager(kind).cloned()
    }
}
