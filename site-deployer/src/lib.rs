//! Site Deployer Library
//!
//! Differential deployment of a generated static site: fingerprint the build
//! root, diff it against the last deployed baseline, push only what changed
//! and advance the baseline once the remote is known to match.

pub mod config;
pub mod daemon;
pub mod deploy;
pub mod diff;
pub mod fs;
pub mod manifest;
pub mod remote;
pub mod transfer;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use deploy::{CycleReport, CycleState, DeployCoordinator};
pub use utils::errors::{DeployError, RemoteError, Result};
