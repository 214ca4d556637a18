//! Jail management module
//!
//! This module provides:
//! - State machine for jail lifecycle management
//! - Root provisioning, mounts, resource limits and process supervision
//! - `JailManager`, which ties them together for one jail

pub mod chroot;
pub mod layout;
pub mod limits;
pub mod manager;
pub mod mounts;
pub mod persist;
pub mod state;
pub mod supervisor;
pub mod types;

// Re-exports
pub use manager::{Backend, JailManager};
pub use state::JailStatus;
pub use types::{ExitOutcome, JailRuntimeInfo, MountRecord};
