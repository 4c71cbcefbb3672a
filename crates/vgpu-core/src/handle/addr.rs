//! Client-visible virtual address space of one resource kind.

use std::collections::BTreeMap;

use super::{HandleError, HandleId};
use crate::resource::ResourceKind;

/// Base of the first kind's range; each kind gets its own window above it.
const SPACE_BASE: u64 = 0x1000_0000_0000;
/// Distance between the windows of consecutive kinds.
const SPACE_STRIDE: u64 = 0x0200_0000_0000;
/// Window size for memory handles.
const MEMORY_SPACE_LEN: u64 = 1 << 40;
/// Window size for every other kind.
const OBJECT_SPACE_LEN: u64 = 1 << 32;

#[derive(Debug, Clone, Copy)]
struct Reservation {
    len: u64,
    owner: HandleId,
}

/// First-fit allocator of client addresses.
#[derive(Debug)]
pub struct VirtualAddressSpace {
    kind: ResourceKind,
    base: u64,
    limit: u64,
    align: u64,
    ranges: BTreeMap<u64, Reservation>,
}

impl VirtualAddressSpace {
    /// Address space covering `[base, limit)` with `align`-aligned reservations.
    ///
    /// `align` must be a power of two.
    #[must_use]
    pub fn new(kind: ResourceKind, base: u64, limit: u64, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self {
            kind,
            base,
            limit,
            align,
            ranges: BTreeMap::new(),
        }
    }

    /// Default window for `kind`.
    #[must_use]
    pub fn for_kind(kind: ResourceKind) -> Self {
        let base = SPACE_BASE + SPACE_STRIDE * u64::from(kind.dependency_rank());
        let (len, align) = if kind == ResourceKind::Memory {
            (MEMORY_SPACE_LEN, 256)
        } else {
            (OBJECT_SPACE_LEN, 16)
        };
        Self::new(kind, base, base + len, align)
    }

    /// Number of live reservations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether nothing is reserved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn align_up(&self, value: u64) -> Option<u64> {
        value.checked_add(self.align - 1).map(|v| v & !(self.align - 1))
    }

    /// Reserve `size` bytes for `owner`, at `expected` if given.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::AddressSpaceExhausted`] when no gap fits, and
    /// [`HandleError::InvalidInput`] when `expected` is misaligned, out of
    /// range or overlaps a live reservation.
    pub fn reserve(&mut self, owner: HandleId, size: u64, expected: Option<u64>) -> Result<u64, HandleError> {
        let size = size.max(1);
        let start = match expected {
            Some(addr) => self.check_expected(addr, size)?,
            None => self.first_fit(size).ok_or(HandleError::AddressSpaceExhausted {
                kind: self.kind,
                requested: size,
            })?,
        };
        self.ranges.insert(start, Reservation { len: size, owner });
        Ok(start)
    }

    fn check_expected(&self, addr: u64, size: u64) -> Result<u64, HandleError> {
        let end = addr.checked_add(size);
        if addr & (self.align - 1) != 0 || addr < self.base || end.map_or(true, |e| e > self.limit) {
            return Err(HandleError::InvalidInput(format!(
                "expected {} address {addr:#x} (+{size}) outside [{:#x}, {:#x}) or misaligned",
                self.kind, self.base, self.limit
            )));
        }
        let overlaps_prev = self
            .ranges
            .range(..=addr)
            .next_back()
            .is_some_and(|(start, r)| start + r.len > addr);
        let overlaps_next = self
            .ranges
            .range(addr..)
            .next()
            .is_some_and(|(start, _)| end.is_some_and(|e| *start < e));
        if overlaps_prev || overlaps_next {
            return Err(HandleError::InvalidInput(format!(
                "expected {} address {addr:#x} is already in use",
                self.kind
            )));
        }
        Ok(addr)
    }

    fn first_fit(&self, size: u64) -> Option<u64> {
        let mut candidate = self.base;
        for (start, r) in &self.ranges {
            if candidate.checked_add(size)? <= *start {
                return Some(candidate);
            }
            candidate = self.align_up(start + r.len)?;
        }
        (candidate.checked_add(size)? <= self.limit).then_some(candidate)
    }

    /// Release the reservation starting at `start`.
    pub fn release(&mut self, start: u64) -> bool {
        self.ranges.remove(&start).is_some()
    }

    /// Resolve an address (possibly interior) to `(owner, start, offset)`.
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<(HandleId, u64, u64)> {
        let (start, r) = self.ranges.range(..=addr).next_back()?;
        let offset = addr - start;
        (offset < r.len).then_some((r.owner, *start, offset))
    }
}
