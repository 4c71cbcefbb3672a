//! Kernel function handles.

use bytes::{Buf, BufMut, BytesMut};

use super::{ResourceKind, ResourceType};
use crate::handle::{HandleError, HandleExtra};

/// Capability implementation for [`ResourceKind::Function`].
///
/// Extra block: `[name_len: u32][name: utf-8]`. The name is the key into the
/// kernel metadata cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionType;

impl ResourceType for FunctionType {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Function
    }

    fn extra_serialize_size(&self, extra: &HandleExtra) -> usize {
        match extra {
            HandleExtra::Function { name } => 4 + name.len(),
            _ => 0,
        }
    }

    fn serialize_extra(&self, extra: &HandleExtra, out: &mut BytesMut) -> Result<(), HandleError> {
        let HandleExtra::Function { name } = extra else {
            return Err(extra.mismatch(ResourceKind::Function));
        };
        let len = u32::try_from(name.len())
            .map_err(|_| HandleError::InvalidInput(format!("function name too long: {} bytes", name.len())))?;
        out.put_u32_le(len);
        out.put_slice(name.as_bytes());
        Ok(())
    }

    fn deserialize_extra(&self, mut raw: &[u8]) -> Result<HandleExtra, HandleError> {
        if raw.remaining() < 4 {
            return Err(HandleError::Snapshot("function extra block truncated".into()));
        }
        let len = raw.get_u32_le() as usize;
        if raw.remaining() < len {
            return Err(HandleError::Snapshot(format!(
                "function name truncated: need {len} bytes, have {}",
                raw.remaining()
            )));
        }
        let name = std::str::from_utf8(&raw[..len])
            .map_err(|e| HandleError::Snapshot(format!("function name is not utf-8: {e}")))?;
        Ok(HandleExtra::Function { name: name.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let extra = HandleExtra::Function {
            name: "_Z6vecAddPfS_S_i".into(),
        };
        let mut out = BytesMut::new();
        FunctionType.serialize_extra(&extra, &mut out).unwrap();
        assert_eq!(out.len(), FunctionType.extra_serialize_size(&extra));
        assert_eq!(FunctionType.deserialize_extra(&out).unwrap(), extra);
    }

    #[test]
    fn test_truncated_name() {
        let mut out = BytesMut::new();
        out.put_u32_le(10);
        out.put_slice(b"abc");
        assert!(FunctionType.deserialize_extra(&out).is_err());
    }
}
