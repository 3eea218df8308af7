//! Instance lifecycle management for challenge environments.
//!
//! [`InstanceManager`] turns start/stop/list requests into runtime calls and
//! [`Reaper`] enforces the maximum instance lifetime in the background.

pub mod config;
pub mod manager;
pub mod policy;
pub mod reaper;

pub use ctf_common as common;
pub use ctf_runtime as runtime;

pub use config::OrchestratorConfig;
pub use manager::{InstanceManager, TaggedContainer};
pub use policy::{ResourceLimits, SeccompProfile, SecurityPolicy};
pub use reaper::Reaper;
