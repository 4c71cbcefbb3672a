//! Checkpoint image format.
//!
//! ```text
//! [magic "VGIM"][format: u32][record_count: u32][reserved: u32]
//! record_count × [len: u32][crc32c: u32][HandleRecord: len bytes]
//! ```
//!
//! Records are written in dependency order, so a reader can rebuild parents
//! before children. The file is written atomically and read back through a
//! read-only memory map.

use std::fs::File;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use memmap2::Mmap;
use tracing::debug;
use vgpu_core::handle::record::HandleRecord;

use crate::error::StorageError;
use crate::store::write_atomic;

/// Image magic.
pub const IMAGE_MAGIC: [u8; 4] = *b"VGIM";
/// Image format version.
pub const IMAGE_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;
const FRAME_LEN: usize = 8;

/// Encode `records` into an image buffer.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_image(records: &[HandleRecord]) -> BytesMut {
    let body: usize = records.iter().map(|r| FRAME_LEN + r.encoded_len()).sum();
    let mut out = BytesMut::with_capacity(HEADER_LEN + body);
    out.put_slice(&IMAGE_MAGIC);
    out.put_u32_le(IMAGE_FORMAT_VERSION);
    out.put_u32_le(records.len() as u32);
    out.put_u32_le(0);

    let mut scratch = BytesMut::new();
    for record in records {
        scratch.clear();
        record.encode(&mut scratch);
        out.put_u32_le(scratch.len() as u32);
        out.put_u32_le(crc32c::crc32c(&scratch));
        out.put_slice(&scratch);
    }
    out
}

/// Write `records` to `path` atomically; returns the file length.
///
/// # Errors
///
/// Returns [`StorageError::Io`] on write failure.
pub fn write_image(path: &Path, records: &[HandleRecord]) -> Result<u64, StorageError> {
    let encoded = encode_image(records);
    write_atomic(path, &encoded)?;
    debug!(path = %path.display(), records = records.len(), bytes = encoded.len(), "wrote checkpoint image");
    Ok(encoded.len() as u64)
}

/// A checkpoint image mapped read-only.
#[derive(Debug)]
pub struct CheckpointImage {
    path: PathBuf,
    map: Mmap,
    count: usize,
}

impl CheckpointImage {
    /// Map the image at `path` and validate its header.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotExist`] when the file is missing
    /// - [`StorageError::CorruptImage`] on a short file or bad header
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotExist(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < HEADER_LEN as u64 {
            return Err(StorageError::CorruptImage(format!("{len} bytes is shorter than the header")));
        }

        // SAFETY: The map is read-only and images are only ever replaced by
        // rename, never modified in place, so the mapped bytes cannot change
        // under us.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file)? };

        let mut header = &map[..HEADER_LEN];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != IMAGE_MAGIC {
            return Err(StorageError::CorruptImage("bad magic".into()));
        }
        let format = header.get_u32_le();
        if format != IMAGE_FORMAT_VERSION {
            return Err(StorageError::CorruptImage(format!("unsupported format {format}")));
        }
        let count = header.get_u32_le() as usize;
        Ok(Self {
            path: path.to_path_buf(),
            map,
            count,
        })
    }

    /// Image path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records the header declares.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the image holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Decode every record, verifying each frame checksum.
    ///
    /// # Errors
    ///
    /// - [`StorageError::CorruptImage`] on truncated frames or trailing bytes
    /// - [`StorageError::ChecksumMismatch`] on a damaged record
    /// - [`StorageError::Handle`] when a record body does not decode
    pub fn records(&self) -> Result<Vec<HandleRecord>, StorageError> {
        let mut buf = &self.map[HEADER_LEN..];
        let mut out = Vec::with_capacity(self.count);
        for index in 0..self.count {
            if buf.len() < FRAME_LEN {
                return Err(StorageError::CorruptImage(format!("record {index} frame truncated")));
            }
            let len = buf.get_u32_le() as usize;
            let expected = buf.get_u32_le();
            if buf.len() < len {
                return Err(StorageError::CorruptImage(format!("record {index} body truncated")));
            }
            let (body, rest) = buf.split_at(len);
            let actual = crc32c::crc32c(body);
            if actual != expected {
                return Err(StorageError::ChecksumMismatch { index, expected, actual });
            }
            let mut cursor = body;
            out.push(HandleRecord::decode(&mut cursor)?);
            if !cursor.is_empty() {
                return Err(StorageError::CorruptImage(format!(
                    "record {index} has {} undecoded bytes",
                    cursor.len()
                )));
            }
            buf = rest;
        }
        if !buf.is_empty() {
            return Err(StorageError::CorruptImage(format!("{} trailing bytes", buf.len())));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;
    use vgpu_core::{HandleId, HandleRef, ResourceKind};

    fn record(id: u64, kind: ResourceKind, parents: Vec<HandleRef>) -> HandleRecord {
        HandleRecord {
            kind,
            id: HandleId(id),
            client_addr: 0x1000 * id,
            size: 64,
            state_size: if kind.is_stateful() { 64 } else { 0 },
            parents,
            children: Vec::new(),
            extra: Bytes::new(),
        }
    }

    fn sample() -> Vec<HandleRecord> {
        let ctx = HandleRef::new(ResourceKind::Context, HandleId(1));
        vec![
            record(1, ResourceKind::Context, Vec::new()),
            record(2, ResourceKind::Memory, vec![ctx]),
            record(3, ResourceKind::Memory, vec![ctx]),
        ]
    }

    #[test]
    fn test_write_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handles.img");
        let records = sample();
        let bytes = write_image(&path, &records).unwrap();
        assert_eq!(bytes, std::fs::metadata(&path).unwrap().len());

        let image = CheckpointImage::open(&path).unwrap();
        assert_eq!(image.len(), 3);
        assert_eq!(image.records().unwrap(), records);
    }

    #[test]
    fn test_empty_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handles.img");
        write_image(&path, &[]).unwrap();
        let image = CheckpointImage::open(&path).unwrap();
        assert!(image.is_empty());
        assert!(image.records().unwrap().is_empty());
    }

    #[test]
    fn test_missing_image() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CheckpointImage::open(&dir.path().join("nope.img")),
            Err(StorageError::NotExist(_))
        ));
    }

    #[test]
    fn test_damaged_record_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handles.img");
        write_image(&path, &sample()).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[HEADER_LEN + FRAME_LEN + 3] ^= 0x55;
        std::fs::write(&path, &raw).unwrap();

        let image = CheckpointImage::open(&path).unwrap();
        assert!(matches!(image.records(), Err(StorageError::ChecksumMismatch { index: 0, .. })));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handles.img");
        std::fs::write(&path, b"XXXX").unwrap();
        assert!(matches!(CheckpointImage::open(&path), Err(StorageError::CorruptImage(_))));

        write_image(&path, &sample()).unwrap();
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 5]).unwrap();
        let image = CheckpointImage::open(&path).unwrap();
        assert!(matches!(image.records(), Err(StorageError::CorruptImage(_))));
    }
}
