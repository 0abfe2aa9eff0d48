//! Interactive judge controller.
//!
//! Runs a judge and a player in separate namespace sandboxes, each confined
//! to its own cgroup, wires the judge's stdout to the player's stdin and back,
//! and collects one verdict line from the judge's fd 3 before a deadline.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux.");

pub mod arbiter;
pub mod bootstrap;
pub mod cgroup;
pub mod config;
pub mod controller;
pub mod error;
pub mod guess;
pub mod launcher;
pub mod monitor;
pub mod pipes;
pub mod stats;

pub use config::{CgroupConfig, CpuMax, RunConfig, SandboxConfig};
pub use controller::run_match;
pub use error::{Error, Result};
pub use stats::{MatchReport, SandboxUsage};
