//! Per-handle snapshot files.
//!
//! ## File format
//!
//! ```text
//! +--------+---------+-------+-----------+---------+------------+-------------+--------+---------+
//! | magic  | format  | flags | handle id | version | state size | payload len | crc32c | payload |
//! | 4B     | u16     | u16   | u64       | u64     | u64        | u64         | u32    | ...     |
//! +--------+---------+-------+-----------+---------+------------+-------------+--------+---------+
//! ```
//!
//! Flag bit 0 marks a delta payload: a sequence of
//! `[offset: u64][len: u32][bytes]` ranges to overlay on the previous
//! committed image. A full payload is the raw state.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fxhash::FxHashMap;
use tracing::{debug, warn};

use crate::handle::bag::PersistedSnapshot;
use crate::handle::{HandleError, HandleId};

/// Snapshot file magic.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"VGSN";
/// Current snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;
/// Granularity at which deltas are detected.
pub const DELTA_BLOCK: usize = 64;

const FLAG_DELTA: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 2 + 8 + 8 + 8 + 8 + 4;
const SNAPSHOT_EXT: &str = "snap";

/// Decoded snapshot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Owning handle.
    pub handle: HandleId,
    /// Checkpoint version.
    pub version: u64,
    /// Whether the payload is a delta.
    pub delta: bool,
    /// Size of the full state image.
    pub state_size: u64,
    /// Payload length.
    pub payload_len: u64,
    /// CRC32C of the payload.
    pub crc: u32,
}

impl SnapshotHeader {
    fn decode(mut buf: &[u8]) -> Result<Self, HandleError> {
        if buf.len() < HEADER_LEN {
            return Err(HandleError::Snapshot(format!(
                "header truncated: {} of {HEADER_LEN} bytes",
                buf.len()
            )));
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SNAPSHOT_MAGIC {
            return Err(HandleError::Snapshot(format!("bad magic {magic:?}")));
        }
        let format = buf.get_u16_le();
        if format != SNAPSHOT_FORMAT_VERSION {
            return Err(HandleError::Snapshot(format!("unsupported format version {format}")));
        }
        let flags = buf.get_u16_le();
        Ok(Self {
            handle: HandleId(buf.get_u64_le()),
            version: buf.get_u64_le(),
            delta: flags & FLAG_DELTA != 0,
            state_size: buf.get_u64_le(),
            payload_len: buf.get_u64_le(),
            crc: buf.get_u32_le(),
        })
    }
}

/// A fully read and checksum-verified snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    /// Header.
    pub header: SnapshotHeader,
    /// Payload.
    pub payload: Bytes,
}

impl SnapshotFile {
    /// Decode and verify an encoded snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Snapshot`] for a bad header, short payload or
    /// checksum mismatch.
    pub fn decode(bytes: Bytes) -> Result<Self, HandleError> {
        let header = SnapshotHeader::decode(&bytes)?;
        let payload = bytes.slice(HEADER_LEN..);
        if payload.len() as u64 != header.payload_len {
            return Err(HandleError::Snapshot(format!(
                "payload length {} does not match header {}",
                payload.len(),
                header.payload_len
            )));
        }
        let actual = crc32c::crc32c(&payload);
        if actual != header.crc {
            return Err(HandleError::Snapshot(format!(
                "checksum mismatch: expected {:08x}, got {actual:08x}",
                header.crc
            )));
        }
        Ok(Self { header, payload })
    }

    /// Read and verify the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::NotExist`] for a missing file, otherwise as
    /// [`decode`](Self::decode).
    pub fn read(path: &Path) -> Result<Self, HandleError> {
        match fs::read(path) {
            Ok(data) => Self::decode(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HandleError::NotExist(path.to_path_buf())),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply this snapshot to `image`: replace it for a full snapshot, overlay
    /// ranges for a delta.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Snapshot`] for a delta that does not fit `image`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(&self, image: &mut Vec<u8>) -> Result<(), HandleError> {
        if !self.header.delta {
            image.clear();
            image.extend_from_slice(&self.payload);
            return Ok(());
        }
        if image.len() as u64 != self.header.state_size {
            return Err(HandleError::Snapshot(format!(
                "delta for {} bytes applied to a {}-byte image",
                self.header.state_size,
                image.len()
            )));
        }
        let mut buf = &self.payload[..];
        while buf.has_remaining() {
            if buf.remaining() < 12 {
                return Err(HandleError::Snapshot("delta range header truncated".into()));
            }
            let offset = buf.get_u64_le() as usize;
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len || offset.saturating_add(len) > image.len() {
                return Err(HandleError::Snapshot(format!(
                    "delta range {offset}+{len} out of bounds"
                )));
            }
            image[offset..offset + len].copy_from_slice(&buf[..len]);
            buf.advance(len);
        }
        Ok(())
    }
}

/// File name of the snapshot of `id` at `version`.
#[must_use]
pub fn snapshot_file_name(id: HandleId, version: u64) -> String {
    format!("h{:016x}-v{version:010}.{SNAPSHOT_EXT}", id.0)
}

fn encode(id: HandleId, version: u64, flags: u16, state_size: u64, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(&SNAPSHOT_MAGIC);
    out.put_u16_le(SNAPSHOT_FORMAT_VERSION);
    out.put_u16_le(flags);
    out.put_u64_le(id.0);
    out.put_u64_le(version);
    out.put_u64_le(state_size);
    out.put_u64_le(payload.len() as u64);
    out.put_u32_le(crc32c::crc32c(payload));
    out.put_slice(payload);
    out.freeze()
}

/// Encode a full snapshot of `state`.
#[must_use]
pub fn encode_full(id: HandleId, version: u64, state: &[u8]) -> Bytes {
    encode(id, version, 0, state.len() as u64, state)
}

/// Encode `current` as a delta against `base`.
///
/// Returns `None` when the images differ in length or the delta would not be
/// smaller than half the full image; the caller then writes a full snapshot.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_delta(id: HandleId, version: u64, base: &[u8], current: &[u8]) -> Option<Bytes> {
    if base.len() != current.len() {
        return None;
    }
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (i, (a, b)) in base.chunks(DELTA_BLOCK).zip(current.chunks(DELTA_BLOCK)).enumerate() {
        if a == b {
            continue;
        }
        let start = i * DELTA_BLOCK;
        match ranges.last_mut() {
            Some((s, len)) if *s + *len == start => *len += b.len(),
            _ => ranges.push((start, b.len())),
        }
    }

    let payload_len: usize = ranges.iter().map(|(_, len)| 12 + len).sum();
    if payload_len >= current.len() / 2 {
        return None;
    }
    let mut payload = BytesMut::with_capacity(payload_len);
    for (start, len) in ranges {
        payload.put_u64_le(start as u64);
        payload.put_u32_le(len as u32);
        payload.put_slice(&current[start..start + len]);
    }
    Some(encode(id, version, FLAG_DELTA, current.len() as u64, &payload))
}

/// Fsync a directory so a rename into it is durable.
#[allow(clippy::unnecessary_wraps)]
fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        fs::File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Write an encoded snapshot into `dir`, atomically via a temp file.
///
/// With `sync`, the file and directory are fsynced before returning.
///
/// # Errors
///
/// Returns [`HandleError::Io`] on any filesystem failure.
pub fn write_snapshot(dir: &Path, id: HandleId, version: u64, encoded: &[u8], sync: bool) -> Result<PathBuf, HandleError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(snapshot_file_name(id, version));
    let tmp = path.with_extension("snap.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(encoded)?;
        if sync {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp, &path)?;
    if sync {
        sync_dir(dir)?;
    }
    Ok(path)
}

/// Rebuild a state image from `chain` (one full snapshot followed by deltas).
///
/// # Errors
///
/// Returns [`HandleError::RestoreFailed`] when a file is missing, corrupt,
/// belongs to another handle or does not match `state_size`.
pub fn replay_chain(id: HandleId, state_size: u64, chain: &[PersistedSnapshot]) -> Result<Vec<u8>, HandleError> {
    let fail = |reason: String| HandleError::RestoreFailed { id, reason };
    let mut image = Vec::new();
    for (i, persisted) in chain.iter().enumerate() {
        let file = SnapshotFile::read(&persisted.path).map_err(|e| fail(e.to_string()))?;
        let header = file.header;
        if header.handle != id || header.version != persisted.version {
            return Err(fail(format!(
                "{} holds handle {} version {}",
                persisted.path.display(),
                header.handle,
                header.version
            )));
        }
        if header.state_size != state_size {
            return Err(fail(format!(
                "snapshot state size {} does not match handle {state_size}",
                header.state_size
            )));
        }
        if i == 0 && header.delta {
            return Err(fail("chain does not start with a full snapshot".into()));
        }
        file.apply(&mut image).map_err(|e| fail(e.to_string()))?;
    }
    debug!(handle = %id, snapshots = chain.len(), bytes = image.len(), "replayed snapshot chain");
    Ok(image)
}

/// Index every readable snapshot in `dir` by handle, each list in version order.
///
/// Files whose header cannot be read are skipped with a warning; only the
/// header is checked here, payload checksums are verified at replay.
///
/// # Errors
///
/// Returns [`HandleError::Io`] if the directory cannot be listed.
pub fn scan_snapshot_dir(dir: &Path) -> Result<FxHashMap<HandleId, Vec<PersistedSnapshot>>, HandleError> {
    let mut index: FxHashMap<HandleId, Vec<PersistedSnapshot>> = FxHashMap::default();
    if !dir.exists() {
        return Ok(index);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
            continue;
        }
        let header = match read_header(&path) {
            Ok(header) => header,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                continue;
            }
        };
        let len = fs::metadata(&path)?.len();
        index.entry(header.handle).or_default().push(PersistedSnapshot {
            version: header.version,
            path,
            delta: header.delta,
            len,
        });
    }
    for snapshots in index.values_mut() {
        snapshots.sort_by_key(|s| s.version);
    }
    Ok(index)
}

fn read_header(path: &Path) -> Result<SnapshotHeader, HandleError> {
    use std::io::Read;
    let mut buf = [0u8; HEADER_LEN];
    fs::File::open(path)?.read_exact(&mut buf)?;
    SnapshotHeader::decode(&buf)
}

/// Delete snapshot files no restore chain can reach.
///
/// For each handle, files older than its newest full snapshot go, except
/// that every version in `pinned` keeps the newest full snapshot at or below
/// it (and everything after) so a retained checkpoint can still be
/// replayed. Returns the number deleted.
///
/// # Errors
///
/// Returns [`HandleError::Io`] on listing or deletion failure.
pub fn compact_snapshot_dir(dir: &Path, pinned: &[u64]) -> Result<usize, HandleError> {
    let mut removed = 0;
    for snapshots in scan_snapshot_dir(dir)?.values() {
        let Some(newest) = snapshots.iter().rposition(|s| !s.delta) else {
            continue;
        };
        let cutoff = pinned
            .iter()
            .filter_map(|bound| snapshots.iter().rposition(|s| !s.delta && s.version <= *bound))
            .fold(newest, usize::min);
        for stale in &snapshots[..cutoff] {
            fs::remove_file(&stale.path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "compacted snapshot directory");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn persist(dir: &Path, id: HandleId, version: u64, encoded: &Bytes, delta: bool) -> PersistedSnapshot {
        let path = write_snapshot(dir, id, version, encoded, true).unwrap();
        PersistedSnapshot {
            version,
            path,
            delta,
            len: encoded.len() as u64,
        }
    }

    #[test]
    fn test_full_snapshot_decode() {
        let encoded = encode_full(HandleId(3), 9, b"hello world");
        let file = SnapshotFile::decode(encoded).unwrap();
        assert_eq!(file.header.handle, HandleId(3));
        assert_eq!(file.header.version, 9);
        assert!(!file.header.delta);
        assert_eq!(&file.payload[..], b"hello world");
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut raw = encode_full(HandleId(1), 1, &[7u8; 32]).to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(
            SnapshotFile::decode(Bytes::from(raw)),
            Err(HandleError::Snapshot(_))
        ));
    }

    #[test]
    fn test_delta_only_carries_changed_blocks() {
        let base = vec![0u8; 4096];
        let mut current = base.clone();
        current[100] = 1;
        current[130] = 2;
        current[3000] = 3;

        let encoded = encode_delta(HandleId(1), 2, &base, &current).unwrap();
        let file = SnapshotFile::decode(encoded).unwrap();
        assert!(file.header.delta);
        // blocks 1 and 2 coalesce, block 46 stands alone
        assert_eq!(file.payload.len(), (12 + 128) + (12 + 64));

        let mut image = base;
        file.apply(&mut image).unwrap();
        assert_eq!(image, current);
    }

    #[test]
    fn test_delta_falls_back_when_large() {
        let base = vec![0u8; 256];
        let current = vec![1u8; 256];
        assert!(encode_delta(HandleId(1), 2, &base, &current).is_none());
        assert!(encode_delta(HandleId(1), 2, &base, &base[..128]).is_none());
    }

    #[test]
    fn test_replay_chain() {
        let dir = TempDir::new().unwrap();
        let id = HandleId(5);
        let v1 = vec![1u8; 1024];
        let mut v2 = v1.clone();
        v2[10] = 9;
        let mut v3 = v2.clone();
        v3[900] = 8;

        let chain = vec![
            persist(dir.path(), id, 1, &encode_full(id, 1, &v1), false),
            persist(dir.path(), id, 2, &encode_delta(id, 2, &v1, &v2).unwrap(), true),
            persist(dir.path(), id, 3, &encode_delta(id, 3, &v2, &v3).unwrap(), true),
        ];
        assert_eq!(replay_chain(id, 1024, &chain).unwrap(), v3);
    }

    #[test]
    fn test_replay_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let id = HandleId(5);
        let snap = persist(dir.path(), id, 1, &encode_full(id, 1, &[0u8; 16]), false);
        fs::remove_file(&snap.path).unwrap();
        assert!(matches!(
            replay_chain(id, 16, &[snap]),
            Err(HandleError::RestoreFailed { id: HandleId(5), .. })
        ));
    }

    #[test]
    fn test_replay_rejects_foreign_snapshot() {
        let dir = TempDir::new().unwrap();
        let snap = persist(dir.path(), HandleId(8), 1, &encode_full(HandleId(8), 1, &[0u8; 16]), false);
        assert!(replay_chain(HandleId(9), 16, &[snap]).is_err());
    }

    #[test]
    fn test_scan_and_compact() {
        let dir = TempDir::new().unwrap();
        let id = HandleId(11);
        let img = vec![0u8; 512];
        let mut next = img.clone();
        next[0] = 1;
        persist(dir.path(), id, 1, &encode_full(id, 1, &img), false);
        persist(dir.path(), id, 2, &encode_delta(id, 2, &img, &next).unwrap(), true);
        persist(dir.path(), id, 3, &encode_full(id, 3, &next), false);
        persist(dir.path(), HandleId(12), 3, &encode_full(HandleId(12), 3, &img), false);
        fs::write(dir.path().join("garbage.snap"), b"nope").unwrap();

        let index = scan_snapshot_dir(dir.path()).unwrap();
        let versions: Vec<u64> = index[&id].iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(index.len(), 2);

        assert_eq!(compact_snapshot_dir(dir.path(), &[]).unwrap(), 2);
        let index = scan_snapshot_dir(dir.path()).unwrap();
        assert_eq!(index[&id].len(), 1);
    }

    #[test]
    fn test_compact_keeps_pinned_anchor() {
        let dir = TempDir::new().unwrap();
        let id = HandleId(13);
        let img = vec![0u8; 512];
        let mut next = img.clone();
        next[9] = 4;
        persist(dir.path(), id, 1, &encode_full(id, 1, &img), false);
        persist(dir.path(), id, 2, &encode_delta(id, 2, &img, &next).unwrap(), true);
        persist(dir.path(), id, 3, &encode_full(id, 3, &next), false);
        persist(dir.path(), id, 4, &encode_full(id, 4, &img), false);

        // Version 2 replays from the full at 1, so nothing can go.
        assert_eq!(compact_snapshot_dir(dir.path(), &[2]).unwrap(), 0);
        assert_eq!(compact_snapshot_dir(dir.path(), &[3]).unwrap(), 2);
        let versions: Vec<u64> = scan_snapshot_dir(dir.path()).unwrap()[&id]
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![3, 4]);
    }
}
