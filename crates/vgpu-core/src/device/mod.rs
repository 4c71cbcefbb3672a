//! Accelerator device seam.
//!
//! The handle and checkpoint layers only talk to hardware through [`Device`].
//! Production builds plug a driver-backed implementation in here;
//! [`SimulatedDevice`] is the in-memory default used by the daemon's tests and
//! by hosts without an accelerator.

mod sim;

pub use sim::{DeviceStats, SimulatedDevice};

/// Identifier of a device execution stream.
pub type StreamId = u64;

/// The default (null) stream.
pub const DEFAULT_STREAM: StreamId = 0;

/// Errors reported by a [`Device`].
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Not enough device memory for the request.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
        /// Bytes still free.
        available: u64,
    },

    /// The address does not name a live resource.
    #[error("invalid device address: {0:#x}")]
    InvalidAddress(u64),

    /// An access ran past the end of a buffer.
    #[error("access out of bounds at {addr:#x}: offset {offset} + {len} > size {size}")]
    OutOfBounds {
        /// Buffer address.
        addr: u64,
        /// Offset of the access.
        offset: u64,
        /// Length of the access.
        len: u64,
        /// Buffer size.
        size: u64,
    },

    /// The stream does not exist on this device.
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),
}

/// Operations the handle layer needs from an accelerator.
///
/// Addresses returned here are *physical* (server-side) addresses. They are
/// never shown to clients and are not stable across a device reset.
pub trait Device: Send + Sync + std::fmt::Debug {
    /// Device ordinal.
    fn ordinal(&self) -> i32;

    /// Allocate `size` bytes of device memory.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfMemory`] when capacity is exhausted.
    fn malloc(&self, size: u64) -> Result<u64, DeviceError>;

    /// Free a buffer returned by [`malloc`](Self::malloc).
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidAddress`] for an unknown buffer.
    fn free(&self, addr: u64) -> Result<(), DeviceError>;

    /// Create an opaque stateless object (context, stream, event, ...).
    ///
    /// # Errors
    ///
    /// Implementation-specific creation failures.
    fn create_object(&self) -> Result<u64, DeviceError>;

    /// Destroy an object returned by [`create_object`](Self::create_object).
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidAddress`] for an unknown object.
    fn destroy_object(&self, addr: u64) -> Result<(), DeviceError>;

    /// Copy host bytes into a buffer at `offset`, ordered on `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfBounds`] or [`DeviceError::InvalidAddress`].
    fn write(&self, addr: u64, offset: u64, data: &[u8], stream: StreamId) -> Result<(), DeviceError>;

    /// Read `len` bytes at `offset` from a buffer, ordered on `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfBounds`] or [`DeviceError::InvalidAddress`].
    fn read(&self, addr: u64, offset: u64, len: u64, stream: StreamId) -> Result<Vec<u8>, DeviceError>;

    /// Device-to-device copy of `len` bytes from the start of `src` to the start of `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfBounds`] or [`DeviceError::InvalidAddress`].
    fn copy(&self, dst: u64, src: u64, len: u64, stream: StreamId) -> Result<(), DeviceError>;

    /// Block until every operation queued on `stream` has completed.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::UnknownStream`] for an unknown stream.
    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError>;

    /// Whether `addr` still names a live buffer or object.
    fn is_alive(&self, addr: u64) -> bool;
}
