//! Records shared across the jail engine

use crate::jail::state::JailStatus;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// One established (or attempted) mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    /// Host path or filesystem source
    pub source: String,
    /// Absolute host path of the mount point, always under the jail root
    pub target: PathBuf,
    /// Filesystem type ("none" for bind mounts)
    pub fstype: String,
    /// Comma-separated options
    pub options: String,
}

impl MountRecord {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<PathBuf>,
        fstype: impl Into<String>,
        options: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            options: options.into(),
        }
    }

    /// Split options into mount flags and the filesystem data string
    ///
    /// `"bind,ro"` becomes `MS_BIND | MS_RDONLY` with no data;
    /// `"gid=5,mode=620"` stays as data.
    pub fn flags_and_data(&self) -> (MsFlags, Option<String>) {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();

        for opt in self.options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match opt {
                "bind" => flags |= MsFlags::MS_BIND,
                "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
                "ro" => flags |= MsFlags::MS_RDONLY,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                other => data.push(other),
            }
        }

        let data = if data.is_empty() {
            None
        } else {
            Some(data.join(","))
        };
        (flags, data)
    }

    pub fn is_bind(&self) -> bool {
        self.flags_and_data().0.contains(MsFlags::MS_BIND)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags_and_data().0.contains(MsFlags::MS_RDONLY)
    }
}

impl fmt::Display for MountRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} type {}", self.source, self.target.display(), self.fstype)?;
        if !self.options.is_empty() {
            write!(f, " ({})", self.options)?;
        }
        Ok(())
    }
}

/// Point-in-time snapshot of a jail
#[derive(Debug, Clone, Serialize)]
pub struct JailRuntimeInfo {
    pub name: String,
    pub status: JailStatus,
    /// Service pid, reported only while RUNNING
    pub pid: Option<i32>,
    pub ssh_port: u16,
    pub listen_address: String,
    pub started_at: Option<SystemTime>,
    pub mounts: Vec<MountRecord>,
    pub last_error: Option<String>,
    pub path: PathBuf,
}

impl JailRuntimeInfo {
    /// Seconds since the jail reached RUNNING
    pub fn uptime_secs(&self) -> Option<u64> {
        let started = self.started_at?;
        SystemTime::now()
            .duration_since(started)
            .ok()
            .map(|d| d.as_secs())
    }
}

/// How a process inside the jail finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code
    Exited(i32),
    /// Killed by a signal
    Signaled(i32),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }

    /// Shell-style exit code (128 + signal for signalled processes)
    pub fn code(&self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => *code,
            ExitOutcome::Signaled(sig) => 128 + sig,
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(sig)) => ExitOutcome::Signaled(sig),
            (None, None) => ExitOutcome::Exited(-1),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(0) => f.write_str("Command executed successfully"),
            ExitOutcome::Exited(code) => {
                write!(f, "Command execution failed (exit code: {})", code)
            }
            ExitOutcome::Signaled(sig) => {
                write!(f, "Command was interrupted by signal {}", sig)
            }
        }
    }
}
