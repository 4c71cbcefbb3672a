//! # vgpu Daemon
//!
//! Facade that wires handle virtualization, checkpoint insertion and
//! recovery into one [`Workspace`]. Each client gets a simulated device, a
//! full set of handle managers and an operation queue; submitted API calls
//! are parsed into queue nodes, and the configured checkpoint policy splices
//! checkpoint nodes in behind them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use vgpu_daemon::{ApiCall, DaemonConfig, Workspace};
//!
//! let workspace = Workspace::new(DaemonConfig::new(dir.path()))?;
//! let client = workspace.create_client()?;
//! let buf = workspace.submit(client, &ApiCall::Malloc { size: 4096 })?.unwrap();
//! workspace.submit(client, &ApiCall::MemcpyHtoD { dst: buf, data: vec![1; 16], stream: 0 })?;
//! workspace.run_pending(client)?;
//!
//! workspace.simulate_device_fault(client)?;
//! workspace.restore_client(client)?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Per-client state and the operation queue
pub mod client;

/// Daemon configuration - TOML-loadable settings
pub mod config;

/// Whole-client checkpoints into the store
pub mod coordinator;

/// Daemon error type
pub mod error;

/// Atomic daemon counters
pub mod metrics;

/// API parse routines
pub mod parser;

/// Checkpoint recovery and in-place restore
pub mod recovery_manager;

/// Tracing subscriber setup
pub mod telemetry;

/// The workspace tying it all together
pub mod workspace;

pub use client::{Client, Effect, OpQueue};
pub use config::DaemonConfig;
pub use coordinator::CheckpointCoordinator;
pub use error::DaemonError;
pub use metrics::{CounterSnapshot, DaemonCounters};
pub use parser::{ApiCall, ApiId, ParseTable};
pub use recovery_manager::{RecoveredClient, RecoveryManager};
pub use telemetry::init_tracing;
pub use workspace::{RunReport, Workspace};

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
