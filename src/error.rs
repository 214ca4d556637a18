//! Unified error types for agi

use crate::jail::state::JailStatus;
use crate::jail::types::ExitOutcome;
use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for jail operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{}': {source}", .path.display())]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Jail errors
    #[error("Jail '{0}' not found")]
    JailNotFound(String),

    #[error("Jail '{0}' already exists")]
    JailAlreadyExists(String),

    #[error("Jail '{name}' has not been created ({} does not exist)", .path.display())]
    JailNotCreated { name: String, path: PathBuf },

    #[error("Jail '{0}' is not running")]
    JailNotRunning(String),

    #[error("Jail '{name}' cannot {action} while {status}")]
    InvalidState {
        name: String,
        action: &'static str,
        status: JailStatus,
    },

    #[error("Jail '{name}' rejected transition from {status}: {reason}")]
    InvalidTransition {
        name: String,
        status: JailStatus,
        reason: String,
    },

    // Provisioning errors
    #[error("Required asset missing: {}", .0.display())]
    MissingAsset(PathBuf),

    #[error("Failed to provision {}: {source}", .path.display())]
    Provision { path: PathBuf, source: io::Error },

    // Mount errors
    #[error("Failed to mount {fstype} on {}: {errno}", .target.display())]
    MountFailed {
        target: PathBuf,
        fstype: String,
        errno: Errno,
    },

    #[error("Mount target {} leaves jail root {}", .target.display(), .root.display())]
    MountEscape { target: PathBuf, root: PathBuf },

    #[error("{} mount(s) still active under {}", .mounts.len(), .root.display())]
    MountsRemain { root: PathBuf, mounts: Vec<PathBuf> },

    // Process errors
    #[error("Failed to spawn '{program}' in {}: {source}", .root.display())]
    SpawnFailed {
        program: String,
        root: PathBuf,
        source: io::Error,
    },

    #[error("Failed to signal process {pid}: {errno}")]
    SignalFailed { pid: i32, errno: Errno },

    #[error("waitpid({pid}) failed: {errno}")]
    WaitFailed { pid: i32, errno: Errno },

    #[error("{script} script failed: {outcome}")]
    ScriptFailed {
        script: &'static str,
        outcome: ExitOutcome,
    },

    #[error("Empty command")]
    EmptyCommand,

    // Teardown errors
    #[error("Failed to remove {}: {source}", .path.display())]
    RemoveFailed { path: PathBuf, source: io::Error },

    // Runtime state errors
    #[error("Runtime state file {}: {source}", .path.display())]
    StateFile { path: PathBuf, source: io::Error },

    #[error("Failed to encode runtime state: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of [`Error`] for callers that branch on outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or structurally invalid input, reported before any OS action
    Config,
    /// Unknown jail name
    NotFound,
    /// Jail root does not exist on disk
    NotCreated,
    /// Operation requires a running jail
    NotRunning,
    /// Name or tree already present
    AlreadyExists,
    /// Lifecycle operation not allowed from the current status
    InvalidState,
    /// A syscall, filesystem or process operation failed
    OsFailure,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigRead { .. }
            | Error::ConfigParse(_)
            | Error::ConfigValidation(_)
            | Error::EmptyCommand => ErrorKind::Config,
            Error::JailNotFound(_) => ErrorKind::NotFound,
            Error::JailNotCreated { .. } => ErrorKind::NotCreated,
            Error::JailNotRunning(_) => ErrorKind::NotRunning,
            Error::JailAlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidState { .. } | Error::InvalidTransition { .. } => {
                ErrorKind::InvalidState
            }
            Error::Io(_)
            | Error::MissingAsset(_)
            | Error::Provision { .. }
            | Error::MountFailed { .. }
            | Error::MountEscape { .. }
            | Error::MountsRemain { .. }
            | Error::SpawnFailed { .. }
            | Error::SignalFailed { .. }
            | Error::WaitFailed { .. }
            | Error::ScriptFailed { .. }
            | Error::RemoveFailed { .. }
            | Error::StateFile { .. }
            | Error::Json(_) => ErrorKind::OsFailure,
        }
    }
}

/// Result type alias for jail operations
pub type Result<T> = std::result::Result<T, Error>;
