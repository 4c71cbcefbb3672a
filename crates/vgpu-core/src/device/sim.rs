//! In-memory simulated accelerator.

use std::sync::atomic::{AtomicU64, Ordering};

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;

use super::{Device, DeviceError, StreamId};

/// First physical address handed out by the simulator.
const PHYS_BASE: u64 = 0x7f00_0000_0000;
/// Physical allocation alignment.
const PHYS_ALIGN: u64 = 256;

/// Counters for observing device traffic in tests.
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// `synchronize` calls.
    pub synchronizations: AtomicU64,
    /// Successful `malloc` calls.
    pub allocations: AtomicU64,
    /// Successful `free` calls.
    pub frees: AtomicU64,
    /// Bytes moved by `write`, `read` and `copy`.
    pub bytes_moved: AtomicU64,
    /// Times the device was reset.
    pub resets: AtomicU64,
}

#[derive(Debug, Default)]
struct SimState {
    next_addr: u64,
    used: u64,
    buffers: FxHashMap<u64, Vec<u8>>,
    objects: FxHashSet<u64>,
}

impl SimState {
    fn bump(&mut self, size: u64) -> u64 {
        let addr = self.next_addr;
        self.next_addr += size.max(1).div_ceil(PHYS_ALIGN) * PHYS_ALIGN;
        addr
    }
}

/// Host-memory backed [`Device`].
///
/// Streams are synchronous, so `synchronize` only records the call. Use
/// [`reset`](Self::reset) to simulate a device fault: every buffer and object
/// is lost and subsequent accesses fail with [`DeviceError::InvalidAddress`].
#[derive(Debug)]
pub struct SimulatedDevice {
    ordinal: i32,
    capacity: u64,
    state: Mutex<SimState>,
    stats: DeviceStats,
}

impl SimulatedDevice {
    /// Create a device with `capacity` bytes of memory.
    #[must_use]
    pub fn new(ordinal: i32, capacity: u64) -> Self {
        Self {
            ordinal,
            capacity,
            state: Mutex::new(SimState {
                next_addr: PHYS_BASE,
                ..SimState::default()
            }),
            stats: DeviceStats::default(),
        }
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Drop every buffer and object, as after a device fault.
    ///
    /// Physical addresses are not reused afterwards.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.buffers.clear();
        state.objects.clear();
        state.used = 0;
        self.stats.resets.fetch_add(1, Ordering::Relaxed);
    }

    fn check_bounds(addr: u64, buf: &[u8], offset: u64, len: u64) -> Result<(), DeviceError> {
        let size = buf.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(DeviceError::OutOfBounds {
                addr,
                offset,
                len,
                size,
            }),
        }
    }
}

impl Device for SimulatedDevice {
    fn ordinal(&self) -> i32 {
        self.ordinal
    }

    fn malloc(&self, size: u64) -> Result<u64, DeviceError> {
        let mut state = self.state.lock();
        let available = self.capacity.saturating_sub(state.used);
        if size > available {
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available,
            });
        }
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory {
            requested: size,
            available,
        })?;
        let addr = state.bump(size);
        state.buffers.insert(addr, vec![0; len]);
        state.used += size;
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn free(&self, addr: u64) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let buf = state.buffers.remove(&addr).ok_or(DeviceError::InvalidAddress(addr))?;
        state.used -= buf.len() as u64;
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_object(&self) -> Result<u64, DeviceError> {
        let mut state = self.state.lock();
        let addr = state.bump(1);
        state.objects.insert(addr);
        Ok(addr)
    }

    fn destroy_object(&self, addr: u64) -> Result<(), DeviceError> {
        if self.state.lock().objects.remove(&addr) {
            Ok(())
        } else {
            Err(DeviceError::InvalidAddress(addr))
        }
    }

    fn write(&self, addr: u64, offset: u64, data: &[u8], _stream: StreamId) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let buf = state.buffers.get_mut(&addr).ok_or(DeviceError::InvalidAddress(addr))?;
        Self::check_bounds(addr, buf, offset, data.len() as u64)?;
        #[allow(clippy::cast_possible_truncation)]
        let start = offset as usize;
        buf[start..start + data.len()].copy_from_slice(data);
        self.stats.bytes_moved.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn read(&self, addr: u64, offset: u64, len: u64, _stream: StreamId) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock();
        let buf = state.buffers.get(&addr).ok_or(DeviceError::InvalidAddress(addr))?;
        Self::check_bounds(addr, buf, offset, len)?;
        #[allow(clippy::cast_possible_truncation)]
        let (start, end) = (offset as usize, (offset + len) as usize);
        self.stats.bytes_moved.fetch_add(len, Ordering::Relaxed);
        Ok(buf[start..end].to_vec())
    }

    fn copy(&self, dst: u64, src: u64, len: u64, _stream: StreamId) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let src_buf = state.buffers.get(&src).ok_or(DeviceError::InvalidAddress(src))?;
        Self::check_bounds(src, src_buf, 0, len)?;
        #[allow(clippy::cast_possible_truncation)]
        let bytes = src_buf[..len as usize].to_vec();
        let dst_buf = state.buffers.get_mut(&dst).ok_or(DeviceError::InvalidAddress(dst))?;
        Self::check_bounds(dst, dst_buf, 0, len)?;
        dst_buf[..bytes.len()].copy_from_slice(&bytes);
        self.stats.bytes_moved.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn synchronize(&self, _stream: StreamId) -> Result<(), DeviceError> {
        self.stats.synchronizations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_alive(&self, addr: u64) -> bool {
        let state = self.state.lock();
        state.buffers.contains_key(&addr) || state.objects.contains(&addr)
    }
}
