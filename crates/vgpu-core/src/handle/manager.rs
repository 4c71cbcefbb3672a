//! Per-kind handle manager.
//!
//! A [`HandleManager`] exclusively owns every handle of one resource kind for
//! one client. It allocates client addresses, materializes physical resources
//! through the kind's [`ResourceType`], aggregates the modified-handle set the
//! checkpoint policy drains, keeps the restore pool, and is the only component
//! that changes a handle's lifecycle status.

use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::addr::VirtualAddressSpace;
use super::bag::PersistedSnapshot;
use super::pool::{HandlePool, PooledResource};
use super::record::HandleRecord;
use super::set::HandleResolver;
use super::{
    next_handle_id, observe_handle_id, HandleError, HandleExtra, HandleId, HandleRef, HandleStatus,
    ResourceHandle, SharedHandle,
};
use crate::device::{Device, StreamId, DEFAULT_STREAM};
use crate::resource::{CommitRequest, ResourceKind, ResourceType, RestorePlan, DEFAULT_HANDLE_SIZE};

/// Handles of other kinds supplied to an allocation, keyed by kind.
///
/// Every supplied handle becomes a parent of the new handle; kinds listed in
/// [`ResourceKind::required_parents`] must be supplied exactly once.
#[derive(Debug, Clone, Default)]
pub struct RelatedHandles {
    inner: BTreeMap<ResourceKind, Vec<SharedHandle>>,
}

impl RelatedHandles {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, kind: ResourceKind, handle: SharedHandle) -> Self {
        self.insert(kind, handle);
        self
    }

    /// Add a related handle of `kind`.
    pub fn insert(&mut self, kind: ResourceKind, handle: SharedHandle) {
        self.inner.entry(kind).or_default().push(handle);
    }

    /// Handles supplied for `kind`.
    #[must_use]
    pub fn get(&self, kind: ResourceKind) -> &[SharedHandle] {
        self.inner.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Iterate every supplied handle with its kind.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &SharedHandle)> {
        self.inner
            .iter()
            .flat_map(|(kind, handles)| handles.iter().map(move |h| (*kind, h)))
    }
}

/// Parameters of [`HandleManager::allocate_mocked_resource`].
#[derive(Debug, Clone)]
pub struct AllocateRequest {
    /// Size of the client-visible range.
    pub size: u64,
    /// Client address to use instead of letting the manager pick one.
    pub expected_addr: Option<u64>,
    /// Size of the device state behind the handle.
    pub state_size: u64,
    /// Type-specific extra fields.
    pub extra: HandleExtra,
}

impl AllocateRequest {
    /// A stateless object handle.
    #[must_use]
    pub fn object() -> Self {
        Self {
            size: DEFAULT_HANDLE_SIZE,
            expected_addr: None,
            state_size: 0,
            extra: HandleExtra::None,
        }
    }

    /// A handle shadowing `size` bytes of device state.
    #[must_use]
    pub fn stateful(size: u64) -> Self {
        Self {
            size,
            expected_addr: None,
            state_size: size,
            extra: HandleExtra::None,
        }
    }

    /// Request a specific client address.
    #[must_use]
    pub fn with_expected_addr(mut self, addr: u64) -> Self {
        self.expected_addr = Some(addr);
        self
    }

    /// Attach type-specific extra fields.
    #[must_use]
    pub fn with_extra(mut self, extra: HandleExtra) -> Self {
        self.extra = extra;
        self
    }
}

/// How a restore request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Adopted a pre-restored pool entry.
    Pooled,
    /// Rebuilt from persisted (or buffered) snapshots.
    Rebuilt,
    /// The handle was already `Active`.
    AlreadyActive,
}

/// Owner and lifecycle authority for all handles of one kind.
#[derive(Debug)]
pub struct HandleManager {
    kind: ResourceKind,
    ops: Arc<dyn ResourceType>,
    device: Arc<dyn Device>,
    handles: RwLock<FxHashMap<HandleId, SharedHandle>>,
    space: Mutex<VirtualAddressSpace>,
    modified: Mutex<FxHashSet<HandleId>>,
    pool: Mutex<HandlePool>,
}

impl HandleManager {
    /// Manager for `ops.kind()` using the kind's default address window.
    #[must_use]
    pub fn new(ops: Arc<dyn ResourceType>, device: Arc<dyn Device>) -> Self {
        let space = VirtualAddressSpace::for_kind(ops.kind());
        Self::with_address_space(ops, device, space)
    }

    /// Manager with an explicit address space.
    #[must_use]
    pub fn with_address_space(ops: Arc<dyn ResourceType>, device: Arc<dyn Device>, space: VirtualAddressSpace) -> Self {
        Self {
            kind: ops.kind(),
            ops,
            device,
            handles: RwLock::new(FxHashMap::default()),
            space: Mutex::new(space),
            modified: Mutex::new(FxHashSet::default()),
            pool: Mutex::new(HandlePool::default()),
        }
    }

    /// Kind of handle this manager owns.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Capability implementation for this kind.
    #[must_use]
    pub fn resource_type(&self) -> &Arc<dyn ResourceType> {
        &self.ops
    }

    /// Number of handles in the index, torn-down ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Look up a handle by id.
    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<SharedHandle> {
        self.handles.read().get(&id).cloned()
    }

    fn require(&self, id: HandleId) -> Result<SharedHandle, HandleError> {
        self.get(id)
            .ok_or(HandleError::NotFound(HandleRef::new(self.kind, id)))
    }

    /// Resolve a client address (interior pointers included) to its handle and
    /// the offset into it.
    #[must_use]
    pub fn get_by_client_addr(&self, addr: u64) -> Option<(SharedHandle, u64)> {
        let (owner, _, offset) = self.space.lock().lookup(addr)?;
        self.get(owner).map(|h| (h, offset))
    }

    /// Every handle, ordered by id.
    #[must_use]
    pub fn handles(&self) -> Vec<SharedHandle> {
        let map = self.handles.read();
        let mut ids: Vec<HandleId> = map.keys().copied().collect();
        ids.sort_unstable();
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }

    /// Ids of handles currently in `status`, ordered.
    #[must_use]
    pub fn ids_with_status(&self, status: HandleStatus) -> Vec<HandleId> {
        self.handles()
            .iter()
            .filter_map(|h| {
                let h = h.lock();
                (h.status() == status).then(|| h.id())
            })
            .collect()
    }

    /// Create the kind's baseline handles unless `is_restoring`.
    ///
    /// Baseline parents are taken from `related`.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures.
    pub fn init(&self, related: &RelatedHandles, is_restoring: bool) -> Result<Vec<SharedHandle>, HandleError> {
        if is_restoring {
            debug!(kind = %self.kind, "skipping baseline handles, restoring");
            return Ok(Vec::new());
        }
        let mut created = Vec::new();
        for baseline in self.ops.baseline_handles() {
            let mut parents = RelatedHandles::new();
            for kind in baseline.parents {
                for h in related.get(*kind) {
                    parents.insert(*kind, Arc::clone(h));
                }
            }
            let request = AllocateRequest::object().with_extra(baseline.extra);
            created.push(self.allocate_mocked_resource(&parents, request)?);
        }
        debug!(kind = %self.kind, count = created.len(), "baseline handles created");
        Ok(created)
    }

    /// Allocate a new `Active` handle.
    ///
    /// On failure nothing changes: no address stays reserved, no physical
    /// resource stays allocated and no parent gains a child.
    ///
    /// # Errors
    ///
    /// - [`HandleError::InvalidInput`] when a required parent kind is not
    ///   supplied exactly once, or a related handle has the wrong kind
    /// - [`HandleError::ResourceUnavailable`] when a related handle is not `Active`
    /// - [`HandleError::AddressSpaceExhausted`] when no client address is left
    /// - [`HandleError::Device`] when materialization fails
    pub fn allocate_mocked_resource(
        &self,
        related: &RelatedHandles,
        request: AllocateRequest,
    ) -> Result<SharedHandle, HandleError> {
        for required in self.kind.required_parents() {
            let supplied = related.get(*required).len();
            if supplied != 1 {
                return Err(HandleError::InvalidInput(format!(
                    "{} allocation needs exactly one {required} handle, got {supplied}",
                    self.kind
                )));
            }
        }
        let mut parents = Vec::new();
        for (kind, shared) in related.iter() {
            let parent = shared.lock();
            if parent.kind() != kind {
                return Err(HandleError::InvalidInput(format!(
                    "related handle {} supplied as {kind}",
                    parent.handle_ref()
                )));
            }
            parent.ensure_usable()?;
            parents.push((parent.handle_ref(), Arc::clone(shared)));
        }

        let id = next_handle_id();
        let client_addr = self.space.lock().reserve(id, request.size, request.expected_addr)?;
        let server_addr = match self.ops.materialize(&*self.device, request.state_size, &request.extra) {
            Ok(addr) => addr,
            Err(e) => {
                self.space.lock().release(client_addr);
                return Err(e);
            }
        };

        let mut handle = ResourceHandle::new(
            id,
            self.kind,
            client_addr,
            request.size.max(1),
            request.state_size,
            request.extra,
        );
        handle.set_server_addr(Some(server_addr));
        handle.set_status(HandleStatus::Active);
        for (parent_ref, _) in &parents {
            handle.record_parent(*parent_ref);
        }
        let me = handle.handle_ref();
        let shared = Arc::new(Mutex::new(handle));
        for (_, parent) in &parents {
            parent.lock().link_child(me);
        }
        self.handles.write().insert(id, Arc::clone(&shared));

        debug!(
            handle = %me,
            client_addr = format_args!("{client_addr:#x}"),
            state_size = request.state_size,
            "allocated handle"
        );
        Ok(shared)
    }

    /// Record that `id`'s device state changed.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::NotFound`] or, for a torn-down handle,
    /// [`HandleError::ResourceUnavailable`].
    pub fn mark_modified(&self, id: HandleId) -> Result<(), HandleError> {
        let shared = self.require(id)?;
        {
            let handle = shared.lock();
            if handle.status() == HandleStatus::TornDown {
                return Err(handle.unavailable());
            }
        }
        self.modified.lock().insert(id);
        Ok(())
    }

    /// Re-insert ids taken by [`take_modified_handles`](Self::take_modified_handles)
    /// whose checkpoint could not be scheduled.
    pub fn remark_modified(&self, ids: &[HandleId]) {
        self.modified.lock().extend(ids.iter().copied());
    }

    /// Snapshot of the modified set, ordered.
    #[must_use]
    pub fn get_modified_handles(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self.modified.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Empty the modified set.
    pub fn clear_modified_handles(&self) {
        self.modified.lock().clear();
    }

    /// Read and clear the modified set under one lock acquisition, so a
    /// concurrent [`mark_modified`](Self::mark_modified) lands either in the
    /// returned set or in the next one.
    #[must_use]
    pub fn take_modified_handles(&self) -> Vec<HandleId> {
        let taken = std::mem::take(&mut *self.modified.lock());
        let mut ids: Vec<HandleId> = taken.into_iter().collect();
        ids.sort_unstable();
        ids
    }

    /// Capture `id`'s device state into its bag for `version`.
    ///
    /// A device failure that leaves the resource gone marks the handle `Broken`.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::ResourceUnavailable`] for a handle that is not
    /// `Active`, and device or version errors otherwise.
    pub fn add(&self, id: HandleId, version: u64, stream: StreamId) -> Result<(), HandleError> {
        let shared = self.require(id)?;
        let mut handle = shared.lock();
        let result = self.ops.add(&*self.device, &mut handle, version, stream);
        if let Err(HandleError::Device(e)) = &result {
            let lost = handle.server_addr().map_or(true, |addr| !self.device.is_alive(addr));
            if lost {
                warn!(handle = %handle.handle_ref(), error = %e, "resource lost during add");
                handle.set_server_addr(None);
                handle.set_status(HandleStatus::Broken);
            }
        }
        result
    }

    /// Flush `id`'s snapshot for `request.version` to storage.
    ///
    /// # Errors
    ///
    /// See [`ResourceType::commit`].
    pub fn commit(&self, id: HandleId, request: &CommitRequest<'_>) -> Result<Option<PersistedSnapshot>, HandleError> {
        let shared = self.require(id)?;
        let mut handle = shared.lock();
        if handle.status() == HandleStatus::TornDown {
            return Err(handle.unavailable());
        }
        let persisted = self.ops.commit(&*self.device, &mut handle, request)?;
        if let Some(snapshot) = &persisted {
            debug!(
                handle = %handle.handle_ref(),
                version = snapshot.version,
                delta = snapshot.delta,
                bytes = snapshot.len,
                "committed snapshot"
            );
        }
        Ok(persisted)
    }

    /// Mark an `Active` handle `Broken`, releasing its resource if it still exists.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::NotFound`] for an unknown id.
    pub fn mark_broken(&self, id: HandleId) -> Result<(), HandleError> {
        let shared = self.require(id)?;
        let mut handle = shared.lock();
        if handle.status() != HandleStatus::Active {
            return Ok(());
        }
        if let Some(addr) = handle.server_addr() {
            if self.device.is_alive(addr) {
                self.ops.release(&*self.device, addr)?;
            }
        }
        handle.set_server_addr(None);
        handle.set_status(HandleStatus::Broken);
        Ok(())
    }

    /// Mark every `Active` handle `Broken`, as after a device fault.
    ///
    /// # Errors
    ///
    /// Propagates release failures.
    pub fn mark_all_broken(&self) -> Result<usize, HandleError> {
        let ids = self.ids_with_status(HandleStatus::Active);
        for id in &ids {
            self.mark_broken(*id)?;
        }
        Ok(ids.len())
    }

    /// Tear down `id`: release its resource and mark it `TornDown`.
    ///
    /// Idempotent; always succeeds for a handle with no backing resource.
    ///
    /// # Errors
    ///
    /// - [`HandleError::ResourceBusy`] while a live child still references it
    ///   or a restore of it is in flight
    /// - [`HandleError::NotFound`] for an unknown id
    /// - release failures from the device
    pub fn tear_down(&self, id: HandleId, resolver: &dyn HandleResolver) -> Result<(), HandleError> {
        let shared = self.require(id)?;
        let (me, parents, client_addr) = {
            let mut handle = shared.lock();
            match handle.status() {
                HandleStatus::TornDown => return Ok(()),
                HandleStatus::Restoring => {
                    return Err(HandleError::ResourceBusy {
                        handle: handle.handle_ref(),
                        reason: "restore in progress".into(),
                    })
                }
                HandleStatus::Active | HandleStatus::Broken => {}
            }
            let live_children: Vec<HandleRef> = handle
                .children()
                .iter()
                .copied()
                .filter(|child| {
                    resolver
                        .resolve(*child)
                        .is_some_and(|c| c.lock().status() != HandleStatus::TornDown)
                })
                .collect();
            if !live_children.is_empty() {
                return Err(HandleError::ResourceBusy {
                    handle: handle.handle_ref(),
                    reason: format!("{} live dependent(s), first {}", live_children.len(), live_children[0]),
                });
            }

            if let Some(addr) = handle.server_addr() {
                if self.device.is_alive(addr) {
                    self.ops.release(&*self.device, addr)?;
                }
            }
            for staged in handle.bag_mut().drain_staged() {
                if self.device.is_alive(staged.addr) {
                    self.device.free(staged.addr)?;
                }
            }
            if let Some(pooled) = self.pool.lock().remove(id) {
                self.release_pooled(&pooled);
            }
            handle.set_server_addr(None);
            handle.set_status(HandleStatus::TornDown);
            (handle.handle_ref(), handle.parents().to_vec(), handle.client_addr())
        };

        for parent in parents {
            if let Some(p) = resolver.resolve(parent) {
                p.lock().unlink_child(me);
            }
        }
        self.space.lock().release(client_addr);
        self.modified.lock().remove(&id);
        debug!(handle = %me, "torn down");
        Ok(())
    }

    fn release_pooled(&self, pooled: &PooledResource) {
        if self.device.is_alive(pooled.server_addr) {
            if let Err(e) = self.ops.release(&*self.device, pooled.server_addr) {
                warn!(handle = %pooled.handle, error = %e, "failed to release pooled resource");
            }
        }
    }

    fn restore_plan(&self, handle: &ResourceHandle) -> RestorePlan {
        RestorePlan {
            handle: handle.handle_ref(),
            state_size: handle.state_size(),
            extra: handle.extra().clone(),
            chain: handle.bag().restore_chain().unwrap_or_default(),
            buffered: handle.bag().latest_staged(),
        }
    }

    /// Pre-restore up to `amount` broken handles into the pool.
    ///
    /// A no-op for kinds that do not support pooling. Returns how many
    /// entries were added.
    ///
    /// # Errors
    ///
    /// Does not fail today: a handle that cannot be pre-restored is skipped
    /// and left for the slow path.
    pub fn preserve_pooled_handles(&self, amount: u64) -> Result<u64, HandleError> {
        if !self.ops.supports_pooling() || amount == 0 {
            return Ok(0);
        }
        let mut preserved = 0;
        for id in self.ids_with_status(HandleStatus::Broken) {
            if preserved >= amount {
                break;
            }
            if self.pool.lock().contains(id) {
                continue;
            }
            let Some(shared) = self.get(id) else { continue };
            let (plan, version) = {
                let handle = shared.lock();
                (self.restore_plan(&handle), handle.bag().restore_target_version())
            };
            match self.ops.restore(&*self.device, &plan, DEFAULT_STREAM) {
                Ok(server_addr) => {
                    let displaced = self.pool.lock().insert(PooledResource {
                        handle: id,
                        server_addr,
                        state_size: plan.state_size,
                        version,
                    });
                    if let Some(old) = displaced {
                        self.release_pooled(&old);
                    }
                    preserved += 1;
                }
                Err(e) => {
                    debug!(handle = %plan.handle, error = %e, "handle not pooled");
                }
            }
        }
        if preserved > 0 {
            info!(kind = %self.kind, preserved, "preserved pooled handles");
        }
        Ok(preserved)
    }

    /// Number of ready pool entries.
    #[must_use]
    pub fn pooled_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Take a compatible pool entry for `handle`, discarding a stale one.
    fn take_pooled(&self, handle: &ResourceHandle) -> Option<PooledResource> {
        let entry = self.pool.lock().remove(handle.id())?;
        let compatible = entry.state_size == handle.state_size()
            && entry.version == handle.bag().restore_target_version()
            && self.device.is_alive(entry.server_addr);
        if compatible {
            Some(entry)
        } else {
            debug!(handle = %handle.handle_ref(), "discarding stale pool entry");
            self.release_pooled(&entry);
            None
        }
    }

    /// Satisfy a restore of `id` from the pool.
    ///
    /// Returns `Ok(false)` when the pool holds no compatible entry; the caller
    /// must then fall back to [`restore`](Self::restore).
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::ResourceUnavailable`] when the handle is neither
    /// `Broken` nor `Restoring`.
    pub fn try_restore_from_pool(&self, id: HandleId) -> Result<bool, HandleError> {
        let shared = self.require(id)?;
        let mut handle = shared.lock();
        if !matches!(handle.status(), HandleStatus::Broken | HandleStatus::Restoring) {
            return Err(handle.unavailable());
        }
        Ok(self.adopt_pooled(&mut handle))
    }

    fn adopt_pooled(&self, handle: &mut ResourceHandle) -> bool {
        match self.take_pooled(handle) {
            Some(entry) => {
                handle.set_server_addr(Some(entry.server_addr));
                handle.set_status(HandleStatus::Active);
                debug!(handle = %handle.handle_ref(), "restored from pool");
                true
            }
            None => false,
        }
    }

    /// Restore a `Broken` handle, preferring the pool.
    ///
    /// The handle is `Restoring` while its resource is rebuilt and becomes
    /// `Active` only once reload succeeded.
    ///
    /// # Errors
    ///
    /// - [`HandleError::ResourceBusy`] when another restore of the handle is in flight
    /// - [`HandleError::ResourceUnavailable`] for a torn-down handle
    /// - [`HandleError::RestoreFailed`] when no usable snapshot exists or reload
    ///   fails; the handle is left `Broken`
    pub fn restore(&self, id: HandleId) -> Result<RestoreOutcome, HandleError> {
        let shared = self.require(id)?;
        let plan = {
            let mut handle = shared.lock();
            match handle.status() {
                HandleStatus::Active => return Ok(RestoreOutcome::AlreadyActive),
                HandleStatus::Restoring => {
                    return Err(HandleError::ResourceBusy {
                        handle: handle.handle_ref(),
                        reason: "restore already in progress".into(),
                    })
                }
                HandleStatus::TornDown => return Err(handle.unavailable()),
                HandleStatus::Broken => {}
            }
            handle.set_status(HandleStatus::Restoring);
            if self.adopt_pooled(&mut handle) {
                return Ok(RestoreOutcome::Pooled);
            }
            self.restore_plan(&handle)
        };

        let rebuilt = self.ops.restore(&*self.device, &plan, DEFAULT_STREAM);
        let mut handle = shared.lock();
        if handle.status() != HandleStatus::Restoring {
            if let Ok(server_addr) = rebuilt {
                if let Err(e) = self.ops.release(&*self.device, server_addr) {
                    warn!(handle = %plan.handle, error = %e, "failed to release orphaned restore");
                }
            }
            return Err(handle.unavailable());
        }
        match rebuilt {
            Ok(server_addr) => {
                handle.set_server_addr(Some(server_addr));
                handle.set_status(HandleStatus::Active);
                debug!(handle = %plan.handle, "rebuilt handle");
                Ok(RestoreOutcome::Rebuilt)
            }
            Err(e) => {
                handle.set_status(HandleStatus::Broken);
                warn!(handle = %plan.handle, error = %e, "restore failed");
                Err(match e {
                    HandleError::RestoreFailed { .. } => e,
                    other => HandleError::RestoreFailed {
                        id,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Serialize `id` into a record.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::NotFound`] or an extra-field encoding error.
    pub fn record(&self, id: HandleId) -> Result<HandleRecord, HandleError> {
        let shared = self.require(id)?;
        let handle = shared.lock();
        HandleRecord::from_handle(&handle, &*self.ops)
    }

    /// Records of every handle that is not torn down, ordered by id.
    ///
    /// # Errors
    ///
    /// Propagates extra-field encoding errors.
    pub fn records(&self) -> Result<Vec<HandleRecord>, HandleError> {
        let mut out = Vec::new();
        for shared in self.handles() {
            let handle = shared.lock();
            if handle.status() != HandleStatus::TornDown {
                out.push(HandleRecord::from_handle(&handle, &*self.ops)?);
            }
        }
        Ok(out)
    }

    /// Recreate a handle from its record as `Broken`, with its original id,
    /// client address and dependency ids, ready for [`restore`](Self::restore).
    ///
    /// `snapshots` seeds the bag with the persisted snapshots found for it.
    ///
    /// # Errors
    ///
    /// - [`HandleError::InvalidInput`] for a record of another kind, a duplicate
    ///   id, or a client address that is already taken
    /// - extra-field decoding errors
    pub fn reallocate_single_handle(
        &self,
        record: &HandleRecord,
        snapshots: Vec<PersistedSnapshot>,
    ) -> Result<SharedHandle, HandleError> {
        if record.kind != self.kind {
            return Err(HandleError::InvalidInput(format!(
                "{} record handed to the {} manager",
                record.kind, self.kind
            )));
        }
        if self.handles.read().contains_key(&record.id) {
            return Err(HandleError::InvalidInput(format!(
                "handle {} already present",
                HandleRef::new(record.kind, record.id)
            )));
        }
        let extra = self.ops.deserialize_extra(&record.extra)?;
        self.space
            .lock()
            .reserve(record.id, record.size, Some(record.client_addr))?;
        observe_handle_id(record.id);

        let mut handle = ResourceHandle::new(
            record.id,
            self.kind,
            record.client_addr,
            record.size,
            record.state_size,
            extra,
        );
        for parent in &record.parents {
            handle.record_parent(*parent);
        }
        for child in &record.children {
            handle.link_child(*child);
        }
        for snapshot in snapshots {
            handle.bag_mut().record_persisted(snapshot)?;
        }
        let shared = Arc::new(Mutex::new(handle));
        self.handles.write().insert(record.id, Arc::clone(&shared));
        Ok(shared)
    }

    /// Re-link `id` into each recorded parent's child set.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::RestoreFailed`] when a recorded parent does not exist.
    pub fn relink(&self, id: HandleId, resolver: &dyn HandleResolver) -> Result<(), HandleError> {
        let shared = self.require(id)?;
        let (me, parents) = {
            let handle = shared.lock();
            (handle.handle_ref(), handle.parents().to_vec())
        };
        for parent in parents {
            let p = resolver.resolve(parent).ok_or_else(|| HandleError::RestoreFailed {
                id,
                reason: format!("parent {parent} missing"),
            })?;
            p.lock().link_child(me);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use crate::handle::ManagerSet;

    fn setup() -> (Arc<SimulatedDevice>, ManagerSet) {
        let device = Arc::new(SimulatedDevice::new(0, 1 << 20));
        let set = ManagerSet::with_default_types(device.clone());
        set.init_all(false).unwrap();
        (device, set)
    }

    fn context_related(set: &ManagerSet) -> RelatedHandles {
        RelatedHandles::new().with(ResourceKind::Context, set.primary(ResourceKind::Context).unwrap())
    }

    #[test]
    fn test_allocate_and_lookup() {
        let (_, set) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        let related = context_related(&set);
        let ctx_ref = set.primary(ResourceKind::Context).unwrap().lock().handle_ref();

        let mut ids = Vec::new();
        for i in 1..=8 {
            let h = mem
                .allocate_mocked_resource(&related, AllocateRequest::stateful(i * 64))
                .unwrap();
            ids.push(h.lock().id());
        }
        for id in ids {
            let h = mem.get(id).unwrap();
            let h = h.lock();
            assert_eq!(h.id(), id);
            assert_eq!(h.status(), HandleStatus::Active);
            assert_eq!(h.parents(), &[ctx_ref]);
        }
        let ctx = set.primary(ResourceKind::Context).unwrap();
        // default stream + 8 buffers
        assert_eq!(ctx.lock().children().len(), 9);
    }

    #[test]
    fn test_allocate_requires_exactly_one_parent() {
        let (_, set) = setup();
        let module = set.manager(ResourceKind::Module).unwrap();
        let err = module
            .allocate_mocked_resource(&RelatedHandles::new(), AllocateRequest::stateful(16))
            .unwrap_err();
        assert!(matches!(err, HandleError::InvalidInput(_)));

        let ctx = set.primary(ResourceKind::Context).unwrap();
        let twice = RelatedHandles::new()
            .with(ResourceKind::Context, ctx.clone())
            .with(ResourceKind::Context, ctx);
        assert!(matches!(
            module.allocate_mocked_resource(&twice, AllocateRequest::stateful(16)),
            Err(HandleError::InvalidInput(_))
        ));
        assert!(module.is_empty());
    }

    #[test]
    fn test_allocation_failure_leaves_manager_unchanged() {
        let device = Arc::new(SimulatedDevice::new(0, 1 << 20));
        let set = ManagerSet::with_default_types(device.clone());
        set.init_all(false).unwrap();
        let tiny = HandleManager::with_address_space(
            ResourceKind::Memory.default_type(),
            device,
            VirtualAddressSpace::new(ResourceKind::Memory, 0x1000, 0x1400, 0x100),
        );
        let related = context_related(&set);
        tiny.allocate_mocked_resource(&related, AllocateRequest::stateful(0x300))
            .unwrap();
        let err = tiny
            .allocate_mocked_resource(&related, AllocateRequest::stateful(0x200))
            .unwrap_err();
        assert!(matches!(err, HandleError::AddressSpaceExhausted { .. }));
        assert_eq!(tiny.len(), 1);
    }

    #[test]
    fn test_device_failure_releases_address() {
        let device = Arc::new(SimulatedDevice::new(0, 256));
        let set = ManagerSet::with_default_types(device);
        set.init_all(false).unwrap();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        let related = context_related(&set);

        let err = mem
            .allocate_mocked_resource(&related, AllocateRequest::stateful(1024))
            .unwrap_err();
        assert!(matches!(err, HandleError::Device(_)));
        assert!(mem.is_empty());

        let ok = mem
            .allocate_mocked_resource(&related, AllocateRequest::stateful(128))
            .unwrap();
        assert_eq!(mem.get_by_client_addr(ok.lock().client_addr() + 5).unwrap().1, 5);
        let ctx = set.primary(ResourceKind::Context).unwrap();
        assert!(ctx.lock().children().contains(&ok.lock().handle_ref()));
    }

    #[test]
    fn test_modified_set() {
        let (_, set) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        let h = mem
            .allocate_mocked_resource(&context_related(&set), AllocateRequest::stateful(32))
            .unwrap();
        let id = h.lock().id();

        mem.mark_modified(id).unwrap();
        mem.mark_modified(id).unwrap();
        assert_eq!(mem.get_modified_handles(), vec![id]);

        mem.clear_modified_handles();
        assert!(mem.get_modified_handles().is_empty());
        mem.clear_modified_handles();
        assert!(mem.get_modified_handles().is_empty());

        mem.mark_modified(id).unwrap();
        assert_eq!(mem.take_modified_handles(), vec![id]);
        assert!(mem.take_modified_handles().is_empty());

        assert!(matches!(
            mem.mark_modified(HandleId(u64::MAX)),
            Err(HandleError::NotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_restore_fails_fast() {
        let (_, set) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        let h = mem
            .allocate_mocked_resource(&context_related(&set), AllocateRequest::stateful(32))
            .unwrap();
        let id = h.lock().id();
        h.lock().set_status(HandleStatus::Restoring);

        assert!(matches!(mem.restore(id), Err(HandleError::ResourceBusy { .. })));
        assert_eq!(h.lock().status(), HandleStatus::Restoring);
    }

    #[test]
    fn test_tear_down_refuses_in_flight_restore() {
        let (_, set) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        let h = mem
            .allocate_mocked_resource(&context_related(&set), AllocateRequest::stateful(32))
            .unwrap();
        let id = h.lock().id();
        h.lock().set_status(HandleStatus::Restoring);

        assert!(matches!(mem.tear_down(id, &set), Err(HandleError::ResourceBusy { .. })));
        assert_eq!(h.lock().status(), HandleStatus::Restoring);
        assert!(mem.get_by_client_addr(h.lock().client_addr()).is_some());
    }

    #[test]
    fn test_host_image_only_kept_for_deltas() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_, set) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        let h = mem
            .allocate_mocked_resource(&context_related(&set), AllocateRequest::stateful(128))
            .unwrap();
        let id = h.lock().id();
        let request = |version, allow_delta| CommitRequest {
            version,
            stream: DEFAULT_STREAM,
            from_cache: true,
            sync: false,
            dir: dir.path(),
            allow_delta,
        };

        mem.add(id, 1, DEFAULT_STREAM).unwrap();
        mem.commit(id, &request(1, false)).unwrap();
        assert!(h.lock().bag().host_image().is_none());

        mem.add(id, 2, DEFAULT_STREAM).unwrap();
        mem.commit(id, &request(2, true)).unwrap();
        assert_eq!(h.lock().bag().host_image().map(|b| b.len()), Some(128));
    }

    #[test]
    fn test_stateless_restore_rebuilds_without_snapshot() {
        let (device, set) = setup();
        let stream = set.manager(ResourceKind::Stream).unwrap();
        let id = stream.ids_with_status(HandleStatus::Active)[0];
        device.reset();
        set.mark_all_broken().unwrap();

        assert_eq!(stream.restore(id).unwrap(), RestoreOutcome::Rebuilt);
        let h = stream.get(id).unwrap();
        let h = h.lock();
        assert_eq!(h.status(), HandleStatus::Active);
        assert!(device.is_alive(h.server_addr().unwrap()));
    }

    #[test]
    fn test_add_on_broken_handle_is_unavailable() {
        let (device, set) = setup();
        let mem = set.manager(ResourceKind::Memory).unwrap();
        let h = mem
            .allocate_mocked_resource(&context_related(&set), AllocateRequest::stateful(32))
            .unwrap();
        let id = h.lock().id();
        device.reset();
        set.mark_all_broken().unwrap();

        assert!(matches!(
            mem.add(id, 1, DEFAULT_STREAM),
            Err(HandleError::ResourceUnavailable {
                status: HandleStatus::Broken,
                ..
            })
        ));
    }

    #[test]
    fn test_record_roundtrip_into_fresh_manager() {
        let (_, set) = setup();
        let stream = set.manager(ResourceKind::Stream).unwrap();
        let h = stream
            .allocate_mocked_resource(
                &context_related(&set),
                AllocateRequest::object().with_extra(HandleExtra::Stream { priority: -1, flags: 1 }),
            )
            .unwrap();
        let id = h.lock().id();
        let record = stream.record(id).unwrap();

        let fresh_device = Arc::new(SimulatedDevice::new(0, 1 << 20));
        let fresh = HandleManager::new(ResourceKind::Stream.default_type(), fresh_device);
        let restored = fresh.reallocate_single_handle(&record, Vec::new()).unwrap();

        let (orig, copy) = (h.lock(), restored.lock());
        assert_eq!(copy.id(), orig.id());
        assert_eq!(copy.client_addr(), orig.client_addr());
        assert_eq!(copy.size(), orig.size());
        assert_eq!(copy.state_size(), orig.state_size());
        assert_eq!(copy.parents(), orig.parents());
        assert_eq!(copy.children(), orig.children());
        assert_eq!(copy.extra(), orig.extra());
        assert_eq!(copy.status(), HandleStatus::Broken);
    }
}
