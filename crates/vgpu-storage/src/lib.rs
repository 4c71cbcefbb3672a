//! # vgpu Storage
//!
//! Durable side of vgpu checkpointing: whole-client checkpoint images,
//! JSON manifests, the filesystem checkpoint store, the optional kernel
//! metadata cache, and the pipeline that rebuilds a client from them.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Storage error type
pub mod error;

/// Checkpoint image files - framed handle records, read through a memory map
pub mod image;

/// Kernel metadata cache - pipe-delimited per-function parameter layouts
pub mod kernel_meta;

/// Checkpoint manifest - JSON description of one whole-client checkpoint
pub mod manifest;

/// Restore pipeline - reallocate, restore and relink handles from an image
pub mod restore;

/// Checkpoint store - manifests and images on the filesystem
pub mod store;

pub use error::StorageError;
pub use image::CheckpointImage;
pub use kernel_meta::{FunctionDesc, KernelMetaCache};
pub use manifest::CheckpointManifest;
pub use restore::{RestorePipeline, RestoreSummary};
pub use store::{CheckpointStore, FileSystemCheckpointStore};
