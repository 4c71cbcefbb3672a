//! Execution stream handles.

use bytes::{Buf, BufMut, BytesMut};

use super::{BaselineHandle, ResourceKind, ResourceType};
use crate::handle::{HandleError, HandleExtra};

/// Capability implementation for [`ResourceKind::Stream`].
///
/// Extra block: `[priority: i32][flags: u32]`. A non-restoring `init` creates
/// the default stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamType;

impl ResourceType for StreamType {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stream
    }

    fn extra_serialize_size(&self, _extra: &HandleExtra) -> usize {
        8
    }

    fn serialize_extra(&self, extra: &HandleExtra, out: &mut BytesMut) -> Result<(), HandleError> {
        let HandleExtra::Stream { priority, flags } = extra else {
            return Err(extra.mismatch(ResourceKind::Stream));
        };
        out.put_i32_le(*priority);
        out.put_u32_le(*flags);
        Ok(())
    }

    fn deserialize_extra(&self, mut raw: &[u8]) -> Result<HandleExtra, HandleError> {
        if raw.remaining() < 8 {
            return Err(HandleError::Snapshot("stream extra block truncated".into()));
        }
        Ok(HandleExtra::Stream {
            priority: raw.get_i32_le(),
            flags: raw.get_u32_le(),
        })
    }

    fn baseline_handles(&self) -> Vec<BaselineHandle> {
        vec![BaselineHandle {
            parents: &[ResourceKind::Context],
            extra: HandleExtra::Stream { priority: 0, flags: 0 },
        }]
    }
}
