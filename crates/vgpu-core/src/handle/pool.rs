//! Pre-restored resources kept ready for fast restore.

use fxhash::FxHashMap;

use super::HandleId;

/// A physical resource rebuilt ahead of need for one broken handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledResource {
    /// Handle the resource was rebuilt for.
    pub handle: HandleId,
    /// Physical address of the rebuilt resource.
    pub server_addr: u64,
    /// Size of the state loaded into it.
    pub state_size: u64,
    /// Checkpoint version replayed into it.
    pub version: Option<u64>,
}

/// Pool of pre-restored resources keyed by the handle they were built for.
///
/// An empty pool is valid and simply sends every restore down the slow path.
#[derive(Debug, Default)]
pub struct HandlePool {
    entries: FxHashMap<HandleId, PooledResource>,
}

impl HandlePool {
    /// Number of ready entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry exists for `handle`.
    #[must_use]
    pub fn contains(&self, handle: HandleId) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Add an entry, returning any entry it displaced.
    pub fn insert(&mut self, entry: PooledResource) -> Option<PooledResource> {
        self.entries.insert(entry.handle, entry)
    }

    /// Remove the entry for `handle`.
    pub fn remove(&mut self, handle: HandleId) -> Option<PooledResource> {
        self.entries.remove(&handle)
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<PooledResource> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}
