//! Physical accelerator handles.

use bytes::{Buf, BufMut, BytesMut};

use super::{BaselineHandle, ResourceKind, ResourceType};
use crate::handle::{HandleError, HandleExtra};

/// Capability implementation for [`ResourceKind::Device`].
///
/// The extra-field block carries the device ordinal so a restored handle binds
/// to the same accelerator.
#[derive(Debug, Clone, Default)]
pub struct DeviceType {
    ordinal: i32,
}

impl DeviceType {
    /// Device type whose baseline handle binds `ordinal`.
    #[must_use]
    pub fn new(ordinal: i32) -> Self {
        Self { ordinal }
    }
}

impl ResourceType for DeviceType {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Device
    }

    fn extra_serialize_size(&self, _extra: &HandleExtra) -> usize {
        std::mem::size_of::<i32>()
    }

    fn serialize_extra(&self, extra: &HandleExtra, out: &mut BytesMut) -> Result<(), HandleError> {
        match extra {
            HandleExtra::Device { ordinal } => {
                out.put_i32_le(*ordinal);
                Ok(())
            }
            other => Err(other.mismatch(ResourceKind::Device)),
        }
    }

    fn deserialize_extra(&self, mut raw: &[u8]) -> Result<HandleExtra, HandleError> {
        if raw.remaining() < 4 {
            return Err(HandleError::Snapshot("device extra block truncated".into()));
        }
        Ok(HandleExtra::Device {
            ordinal: raw.get_i32_le(),
        })
    }

    fn baseline_handles(&self) -> Vec<BaselineHandle> {
        vec![BaselineHandle {
            parents: &[],
            extra: HandleExtra::Device {
                ordinal: self.ordinal,
            },
        }]
    }
}
