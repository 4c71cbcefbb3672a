use std::path::PathBuf;

use vgpu_core::HandleError;

/// Errors from checkpoint storage and restore.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("manifest serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Image header or framing is invalid.
    #[error("corrupt checkpoint image: {0}")]
    CorruptImage(String),

    /// A record's checksum does not match its bytes.
    #[error("record {index} checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Record position in the image.
        index: usize,
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum of the bytes read.
        actual: u32,
    },

    /// No checkpoint with this id.
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(u64),

    /// An optional file does not exist.
    #[error("{0} does not exist")]
    NotExist(PathBuf),

    /// Malformed kernel metadata line.
    #[error("kernel metadata line {line}: {reason}")]
    KernelMeta {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// A handle operation failed during restore.
    #[error("handle error: {0}")]
    Handle(#[from] HandleError),
}
