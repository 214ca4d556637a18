//! Process execution inside a chroot
//!
//! Children are forked through `std::process::Command`; the `pre_exec` hook
//! applies resource limits, changes root, and optionally starts a new session
//! before the program is exec'd.

use crate::error::{Error, Result};
use crate::jail::limits::ResourceLimiter;
use crate::jail::types::ExitOutcome;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, chdir, chroot, setsid};
use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A program to run inside a jail root
#[derive(Debug, Clone, Default)]
pub struct ChrootCommand {
    /// Path as seen from inside the jail
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment; nothing is inherited
    pub env: Vec<(String, String)>,
    /// Limits applied in the child before exec
    pub limits: Option<ResourceLimiter>,
    /// Start a new session and detach stdio
    pub detach: bool,
}

impl ChrootCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn limits(mut self, limits: ResourceLimiter) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    /// Program and arguments joined for log messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// OS seam for running processes inside a jail root
pub trait Chroot: Send + Sync {
    /// Start a long-lived process and return its pid
    fn spawn(&self, root: &Path, command: &ChrootCommand) -> Result<Pid>;

    /// Run a process to completion
    fn run(&self, root: &Path, command: &ChrootCommand) -> Result<ExitOutcome>;

    /// Send SIGTERM and wait for exit
    ///
    /// With a grace period, SIGKILL follows once it elapses. Returns `None`
    /// when the exit status could not be collected.
    fn terminate(&self, pid: Pid, grace: Option<Duration>) -> Result<Option<ExitOutcome>>;

    /// True if `pid` is alive and chrooted at `root`
    ///
    /// Guards against pid reuse: a recorded pid only counts as the jail's
    /// process while it still runs inside the jail.
    fn is_jailed(&self, pid: Pid, root: &Path) -> bool;
}

/// Root directory of a running process, from `/proc/<pid>/root`
pub fn process_root(pid: Pid) -> io::Result<PathBuf> {
    fs::read_link(format!("/proc/{}/root", pid))
}

/// Chroot backed by fork/chroot/exec
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemChroot;

impl SystemChroot {
    fn command(root: &Path, spec: &ChrootCommand) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        if spec.detach {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        let root: PathBuf = root.to_path_buf();
        let limits = spec.limits.clone();
        let detach = spec.detach;
        unsafe {
            cmd.pre_exec(move || {
                if let Some(limits) = &limits {
                    limits.apply();
                }
                chroot(root.as_path()).map_err(io::Error::from)?;
                chdir("/").map_err(io::Error::from)?;
                if detach {
                    setsid().map_err(io::Error::from)?;
                }
                Ok(())
            });
        }
        cmd
    }

    /// Wait for a child of this process
    fn wait_child(pid: Pid, grace: Option<Duration>) -> Result<Option<ExitOutcome>> {
        let mut deadline = grace.map(|g| Instant::now() + g);

        loop {
            let flags = deadline.map(|_| WaitPidFlag::WNOHANG);
            match waitpid(pid, flags) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(Some(ExitOutcome::Exited(code))),
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    return Ok(Some(ExitOutcome::Signaled(sig as i32)));
                }
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Self::wait_foreign(pid, deadline),
                Err(errno) => return Err(Error::WaitFailed { pid: pid.as_raw(), errno }),
            }

            if let Some(limit) = deadline {
                if Instant::now() >= limit {
                    Self::force_kill(pid)?;
                    deadline = None;
                    continue;
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    /// Wait for a process this one did not fork (adopted from a state file)
    fn wait_foreign(pid: Pid, mut deadline: Option<Instant>) -> Result<Option<ExitOutcome>> {
        while kill(pid, None).is_ok() {
            if let Some(limit) = deadline {
                if Instant::now() >= limit {
                    Self::force_kill(pid)?;
                    deadline = None;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(None)
    }

    fn force_kill(pid: Pid) -> Result<()> {
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(Error::SignalFailed { pid: pid.as_raw(), errno }),
        }
    }
}

impl Chroot for SystemChroot {
    fn spawn(&self, root: &Path, command: &ChrootCommand) -> Result<Pid> {
        let child = Self::command(root, command)
            .spawn()
            .map_err(|e| Error::SpawnFailed {
                program: command.program.clone(),
                root: root.to_path_buf(),
                source: e,
            })?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn run(&self, root: &Path, command: &ChrootCommand) -> Result<ExitOutcome> {
        let status = Self::command(root, command)
            .status()
            .map_err(|e| Error::SpawnFailed {
                program: command.program.clone(),
                root: root.to_path_buf(),
                source: e,
            })?;
        Ok(ExitOutcome::from(status))
    }

    fn terminate(&self, pid: Pid, grace: Option<Duration>) -> Result<Option<ExitOutcome>> {
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(None),
            Err(errno) => return Err(Error::SignalFailed { pid: pid.as_raw(), errno }),
        }
        Self::wait_child(pid, grace)
    }

    fn is_jailed(&self, pid: Pid, root: &Path) -> bool {
        let alive = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => false,
            Err(Errno::ECHILD) => kill(pid, None).is_ok(),
            Err(_) => false,
        };
        alive
            && match (process_root(pid), root.canonicalize()) {
                (Ok(actual), Ok(expected)) => actual == expected,
                _ => false,
            }
    }
}
