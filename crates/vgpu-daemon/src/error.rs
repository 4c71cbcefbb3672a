//! Error types for the daemon facade.

use vgpu_core::checkpoint::CheckpointError;
use vgpu_core::{DeviceError, HandleError};
use vgpu_storage::StorageError;

/// Errors from daemon operations.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Client not registered
    #[error("Client {0} not found")]
    UnknownClient(u64),

    /// No parse routine for an API id
    #[error("No parse routine for API {0:#x}")]
    UnknownApi(u64),

    /// Malformed call parameters
    #[error("Invalid call: {0}")]
    InvalidCall(String),

    /// No checkpoint to recover from
    #[error("No checkpoint available")]
    NoCheckpoint,

    /// Device error while executing a queued operation
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Handle error
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),

    /// Checkpoint policy or engine error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
