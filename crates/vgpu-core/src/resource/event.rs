//! Synchronization event handles.

use bytes::{Buf, BufMut, BytesMut};

use super::{ResourceKind, ResourceType};
use crate::handle::{HandleError, HandleExtra};

/// Capability implementation for [`ResourceKind::Event`]. Extra block: `[flags: u32]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventType;

impl ResourceType for EventType {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Event
    }

    fn extra_serialize_size(&self, _extra: &HandleExtra) -> usize {
        4
    }

    fn serialize_extra(&self, extra: &HandleExtra, out: &mut BytesMut) -> Result<(), HandleError> {
        let HandleExtra::Event { flags } = extra else {
            return Err(extra.mismatch(ResourceKind::Event));
        };
        out.put_u32_le(*flags);
        Ok(())
    }

    fn deserialize_extra(&self, mut raw: &[u8]) -> Result<HandleExtra, HandleError> {
        if raw.remaining() < 4 {
            return Err(HandleError::Snapshot("event extra block truncated".into()));
        }
        Ok(HandleExtra::Event { flags: raw.get_u32_le() })
    }
}
