//! # HyperTool – Hyper-V Orchestration Core
//!
//! Local Hyper-V management driven through the Hyper-V PowerShell module.
//! Every operation is one out-of-process PowerShell invocation whose JSON
//! output is decoded tolerantly. Provides:
//!
//! - **VM Lifecycle** – list, query, start, graceful shutdown, turn off,
//!   restart
//! - **Networking** – virtual switches, VM adapter connect / disconnect /
//!   rename, host uplink adapters including the Default Switch NAT adapter
//! - **Console** – `vmconnect.exe` windows, optionally in session-edit mode
//! - **Checkpoints** – list, tree, create with production-to-standard
//!   fallback, apply, remove
//! - **Export / Import** – disk space check, host jobs with progress,
//!   cancellation and import name-conflict resolution
//! - **Elevation** – elevated relaunch for restarting the Host Network
//!   Service and the helper-mode entry point

pub mod types;
pub mod error;
pub mod rows;
pub mod powershell;
pub mod vm;
pub mod network;
pub mod console;
pub mod snapshot;
pub mod transfer;
pub mod elevation;
pub mod service;

pub use error::{HyperVError, HyperVErrorKind, HyperVResult};
pub use service::{HyperVService, HyperVServiceState};
pub use types::HyperVConfig;
pub use tokio_util::sync::CancellationToken;
