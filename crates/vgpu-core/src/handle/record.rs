//! Serialized handle records.
//!
//! ```text
//! [type_id: u16][id: u64][client_addr: u64][size: u64][state_size: u64]
//! [n_parents: u32] n × [type_id: u16][id: u64]
//! [n_children: u32] n × [type_id: u16][id: u64]
//! [extra_len: u32][extra: extra_len bytes]
//! ```
//!
//! All integers are little-endian. `extra_len` is whatever the resource type
//! reports as its extra serialization size; zero for kinds with no extra fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{HandleError, HandleId, HandleRef, ResourceHandle};
use crate::resource::{ResourceKind, ResourceType};

const FIXED_LEN: usize = 2 + 8 * 4;
const REF_LEN: usize = 2 + 8;

/// Generic handle fields plus the raw type-specific extra block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRecord {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Handle id.
    pub id: HandleId,
    /// Client-visible address.
    pub client_addr: u64,
    /// Size of the client range.
    pub size: u64,
    /// Size of the device state.
    pub state_size: u64,
    /// Parent references.
    pub parents: Vec<HandleRef>,
    /// Child references.
    pub children: Vec<HandleRef>,
    /// Type-specific extra fields, still encoded.
    pub extra: Bytes,
}

impl HandleRecord {
    /// Capture `handle` using `ty` to encode its extra fields.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::InvalidInput`] if the extra block does not match
    /// the size the type declares.
    pub fn from_handle(handle: &ResourceHandle, ty: &dyn ResourceType) -> Result<Self, HandleError> {
        let declared = ty.extra_serialize_size(handle.extra());
        let mut extra = BytesMut::with_capacity(declared);
        ty.serialize_extra(handle.extra(), &mut extra)?;
        if extra.len() != declared {
            return Err(HandleError::InvalidInput(format!(
                "{} extra block is {} bytes, type declares {declared}",
                handle.kind(),
                extra.len()
            )));
        }
        Ok(Self {
            kind: handle.kind(),
            id: handle.id(),
            client_addr: handle.client_addr(),
            size: handle.size(),
            state_size: handle.state_size(),
            parents: handle.parents().to_vec(),
            children: handle.children().iter().copied().collect(),
            extra: extra.freeze(),
        })
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_LEN + 4 + REF_LEN * self.parents.len() + 4 + REF_LEN * self.children.len() + 4 + self.extra.len()
    }

    /// Append the encoded record to `out`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.encoded_len());
        out.put_u16_le(self.kind.type_id());
        out.put_u64_le(self.id.0);
        out.put_u64_le(self.client_addr);
        out.put_u64_le(self.size);
        out.put_u64_le(self.state_size);
        for refs in [&self.parents, &self.children] {
            out.put_u32_le(refs.len() as u32);
            for r in refs {
                out.put_u16_le(r.kind.type_id());
                out.put_u64_le(r.id.0);
            }
        }
        out.put_u32_le(self.extra.len() as u32);
        out.put_slice(&self.extra);
    }

    /// Decode one record from the front of `buf`, advancing it.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Snapshot`] for truncated input or unknown kinds.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, HandleError> {
        need(buf, FIXED_LEN)?;
        let kind = decode_kind(buf.get_u16_le())?;
        let id = HandleId(buf.get_u64_le());
        let client_addr = buf.get_u64_le();
        let size = buf.get_u64_le();
        let state_size = buf.get_u64_le();
        let parents = decode_refs(buf)?;
        let children = decode_refs(buf)?;
        need(buf, 4)?;
        let extra_len = buf.get_u32_le() as usize;
        need(buf, extra_len)?;
        let extra = Bytes::copy_from_slice(&buf[..extra_len]);
        buf.advance(extra_len);
        Ok(Self {
            kind,
            id,
            client_addr,
            size,
            state_size,
            parents,
            children,
            extra,
        })
    }
}

fn need(buf: &[u8], len: usize) -> Result<(), HandleError> {
    if buf.len() < len {
        return Err(HandleError::Snapshot(format!(
            "handle record truncated: need {len} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}

fn decode_kind(type_id: u16) -> Result<ResourceKind, HandleError> {
    ResourceKind::from_type_id(type_id)
        .ok_or_else(|| HandleError::Snapshot(format!("unknown resource type id {type_id}")))
}

fn decode_refs(buf: &mut &[u8]) -> Result<Vec<HandleRef>, HandleError> {
    need(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    need(buf, count.saturating_mul(REF_LEN))?;
    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = decode_kind(buf.get_u16_le())?;
        refs.push(HandleRef::new(kind, HandleId(buf.get_u64_le())));
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> HandleRecord {
        HandleRecord {
            kind: ResourceKind::Function,
            id: HandleId(42),
            client_addr: 0xdead_0000,
            size: 1,
            state_size: 0,
            parents: vec![HandleRef::new(ResourceKind::Module, HandleId(7))],
            children: vec![],
            extra: Bytes::from_static(b"\x03\x00\x00\x00abc"),
        }
    }

    #[test]
    fn test_encode_decode() {
        let rec = record();
        let mut out = BytesMut::new();
        rec.encode(&mut out);
        assert_eq!(out.len(), rec.encoded_len());

        let mut slice = &out[..];
        assert_eq!(HandleRecord::decode(&mut slice).unwrap(), rec);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_truncated_record() {
        let mut out = BytesMut::new();
        record().encode(&mut out);
        let mut slice = &out[..out.len() - 1];
        assert!(matches!(HandleRecord::decode(&mut slice), Err(HandleError::Snapshot(_))));
    }

    #[test]
    fn test_unknown_kind() {
        let mut out = BytesMut::new();
        record().encode(&mut out);
        out[0] = 0xff;
        let mut slice = &out[..];
        assert!(HandleRecord::decode(&mut slice).is_err());
    }
}
