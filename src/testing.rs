//! In-memory OS seams for unprivileged tests

use crate::error::{Error, Result};
use crate::jail::chroot::{Chroot, ChrootCommand};
use crate::jail::mounts::Mounter;
use crate::jail::types::{ExitOutcome, MountRecord};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

/// Mounter that tracks a fake mount table
#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<PathBuf>>,
    unmounts: Mutex<Vec<PathBuf>>,
    table: Mutex<Vec<PathBuf>>,
    busy: Mutex<HashMap<PathBuf, u32>>,
    mount_failures: Mutex<HashMap<PathBuf, Errno>>,
    unmount_failures: Mutex<HashMap<PathBuf, Errno>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `target` report EBUSY for the next `times` unmount attempts
    pub fn busy_for(&self, target: PathBuf, times: u32) {
        self.busy.lock().unwrap().insert(target, times);
    }

    pub fn fail_mount(&self, target: PathBuf, errno: Errno) {
        self.mount_failures.lock().unwrap().insert(target, errno);
    }

    pub fn fail_unmount(&self, target: PathBuf, errno: Errno) {
        self.unmount_failures.lock().unwrap().insert(target, errno);
    }

    /// Pretend something else mounted `target`
    pub fn add_to_table(&self, target: PathBuf) {
        self.table.lock().unwrap().push(target);
    }

    pub fn mount_calls(&self) -> Vec<PathBuf> {
        self.mounts.lock().unwrap().clone()
    }

    pub fn unmount_calls(&self) -> Vec<PathBuf> {
        self.unmounts.lock().unwrap().clone()
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, record: &MountRecord) -> std::result::Result<(), Errno> {
        self.mounts.lock().unwrap().push(record.target.clone());
        if let Some(errno) = self.mount_failures.lock().unwrap().get(&record.target) {
            return Err(*errno);
        }
        self.table.lock().unwrap().push(record.target.clone());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), Errno> {
        self.unmounts.lock().unwrap().push(target.to_path_buf());

        if let Some(remaining) = self.busy.lock().unwrap().get_mut(target) {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(1);
                return Err(Errno::EBUSY);
            }
        }
        if let Some(errno) = self.unmount_failures.lock().unwrap().get(target) {
            return Err(*errno);
        }

        let mut table = self.table.lock().unwrap();
        if let Some(pos) = table.iter().rposition(|p| p == target) {
            table.remove(pos);
        }
        Ok(())
    }

    fn mount_table(&self) -> io::Result<Vec<PathBuf>> {
        Ok(self.table.lock().unwrap().clone())
    }
}

/// A recorded call into [`FakeChroot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChrootCall {
    Spawn { root: PathBuf, program: String },
    Run { root: PathBuf, program: String, args: Vec<String> },
    Terminate(Pid),
}

/// Chroot that hands out synthetic pids and scripted exit outcomes
pub struct FakeChroot {
    next_pid: AtomicI32,
    calls: Mutex<Vec<ChrootCall>>,
    /// Live processes and the root each one runs in
    alive: Mutex<HashMap<Pid, PathBuf>>,
    outcomes: Mutex<Vec<(String, ExitOutcome)>>,
    terminate_failure: Mutex<Option<Errno>>,
    paused: Mutex<Option<(String, Arc<Barrier>)>>,
}

impl FakeChroot {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(4000),
            calls: Mutex::new(Vec::new()),
            alive: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(Vec::new()),
            terminate_failure: Mutex::new(None),
            paused: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<ChrootCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Runs whose arguments contain `needle` finish with `outcome`
    pub fn script_outcome(&self, needle: &str, outcome: ExitOutcome) {
        self.outcomes.lock().unwrap().push((needle.to_string(), outcome));
    }

    /// Make every terminate fail to signal
    pub fn fail_terminate(&self, errno: Errno) {
        *self.terminate_failure.lock().unwrap() = Some(errno);
    }

    /// Simulate the process dying on its own
    pub fn exit(&self, pid: Pid) {
        self.alive.lock().unwrap().remove(&pid);
    }

    /// Pretend an unrelated process `pid` exists, rooted at `root`
    pub fn add_process(&self, pid: Pid, root: PathBuf) {
        self.alive.lock().unwrap().insert(pid, root);
    }

    /// Runs whose arguments contain `needle` wait on `barrier` twice:
    /// once on entry and once before returning
    pub fn pause_runs(&self, needle: &str, barrier: Arc<Barrier>) {
        *self.paused.lock().unwrap() = Some((needle.to_string(), barrier));
    }
}

impl Default for FakeChroot {
    fn default() -> Self {
        Self::new()
    }
}

impl Chroot for FakeChroot {
    fn spawn(&self, root: &Path, command: &ChrootCommand) -> Result<Pid> {
        self.calls.lock().unwrap().push(ChrootCall::Spawn {
            root: root.to_path_buf(),
            program: command.program.clone(),
        });
        let pid = Pid::from_raw(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.alive.lock().unwrap().insert(pid, root.to_path_buf());
        Ok(pid)
    }

    fn run(&self, root: &Path, command: &ChrootCommand) -> Result<ExitOutcome> {
        self.calls.lock().unwrap().push(ChrootCall::Run {
            root: root.to_path_buf(),
            program: command.program.clone(),
            args: command.args.clone(),
        });

        let barrier = self
            .paused
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(needle, _)| command.args.iter().any(|a| a.contains(needle.as_str())))
            .map(|(_, barrier)| barrier.clone());
        if let Some(barrier) = &barrier {
            barrier.wait();
            barrier.wait();
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| command.args.iter().any(|a| a.contains(needle.as_str())))
            .map(|(_, outcome)| *outcome)
            .unwrap_or(ExitOutcome::Exited(0));
        Ok(outcome)
    }

    fn terminate(&self, pid: Pid, _grace: Option<Duration>) -> Result<Option<ExitOutcome>> {
        self.calls.lock().unwrap().push(ChrootCall::Terminate(pid));
        if let Some(errno) = *self.terminate_failure.lock().unwrap() {
            return Err(Error::SignalFailed {
                pid: pid.as_raw(),
                errno,
            });
        }
        if self.alive.lock().unwrap().remove(&pid).is_some() {
            Ok(Some(ExitOutcome::Signaled(15)))
        } else {
            Ok(None)
        }
    }

    fn is_jailed(&self, pid: Pid, root: &Path) -> bool {
        self.alive.lock().unwrap().get(&pid).is_some_and(|r| r == root)
    }
}
