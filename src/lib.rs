//! agi - Linux chroot jail manager
//!
//! Builds chroot environments with an SSH daemon inside, and drives their
//! lifecycle (create, start, stop, destroy, execute) through a state machine.

pub mod error;
pub mod jail;
pub mod logging;
pub mod manifest;
pub mod registry;

#[cfg(test)]
mod testing;

pub use error::{Error, ErrorKind, Result};
pub use jail::{Backend, ExitOutcome, JailManager, JailRuntimeInfo, JailStatus};
pub use registry::JailRegistry;
