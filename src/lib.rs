//! nodeherd - lifecycle supervision for externally spawned worker processes.
//!
//! Three layers, bottom-up:
//! - [`process::launcher`]: stateless OS-facing primitives (spawn with
//!   resource ceilings, signal, probe, reap, read accounting);
//! - [`process::ManagedProcess`]: one node's lifecycle - state machine,
//!   monitoring loop, crash detection, bounded auto-restart, zombie-free
//!   teardown;
//! - [`fleet::FleetManager`]: a named collection of managed processes with
//!   admission control, batch operations, aggregate statistics, and a
//!   fleet-wide budget-enforcement loop.
//!
//! Node processes are described by a [`manifest::NodeManifest`], produced by
//! an external discovery subsystem and consumed here as an opaque input.

pub mod error;
pub mod fleet;
pub mod manifest;
pub mod process;

pub use error::{HerdError, Result};
pub use fleet::{FleetConfig, FleetManager, ManagerStats};
pub use manifest::{NodeManifest, ResourceSpec};
pub use process::{
    LaunchSpec, LimitBreach, ManagedProcess, ProcessState, ProcessStats, ResourceLimits,
};
