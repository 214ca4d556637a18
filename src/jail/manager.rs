//! Lifecycle management for a single jail
//!
//! A [`JailManager`] owns one jail root at `<base>/jails/<name>` together
//! with its state machine, active mounts and supervised service. Lifecycle
//! operations are serialized by an internal lock; `execute` only takes a
//! shared gate that `stop` acquires exclusively before tearing mounts down.

use crate::error::{Error, Result};
use crate::jail::chroot::{Chroot, SystemChroot};
use crate::jail::layout::{self, Provisioner};
use crate::jail::limits::ResourceLimiter;
use crate::jail::mounts::{self, MountCoordinator, Mounter, SystemMounter, UnmountPolicy};
use crate::jail::persist::{RuntimeRecord, StateFile};
use crate::jail::state::{JailStatus, Lifecycle, Transition};
use crate::jail::supervisor::{self, CLEANUP_SCRIPT, INIT_SCRIPT, ProcessSupervisor};
use crate::jail::types::{ExitOutcome, JailRuntimeInfo};
use crate::logging::LogSink;
use crate::manifest::{EnvironmentConfig, JailSettings, has_parent_segment};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

const LOG: &str = "jail";

/// The OS seams a jail drives
#[derive(Clone)]
pub struct Backend {
    pub mounter: Arc<dyn Mounter>,
    pub chroot: Arc<dyn Chroot>,
}

impl Backend {
    pub fn new(mounter: Arc<dyn Mounter>, chroot: Arc<dyn Chroot>) -> Self {
        Self { mounter, chroot }
    }

    /// Real mount(2) and fork/chroot/exec
    pub fn system() -> Self {
        Self::new(Arc::new(SystemMounter), Arc::new(SystemChroot))
    }
}

struct Inner {
    lifecycle: Lifecycle,
    mounts: MountCoordinator,
    supervisor: ProcessSupervisor,
    started_at: Option<SystemTime>,
    last_error: Option<String>,
}

/// Manages one jail
pub struct JailManager {
    config: Arc<EnvironmentConfig>,
    settings: Arc<JailSettings>,
    root: PathBuf,
    chroot: Arc<dyn Chroot>,
    sink: Arc<dyn LogSink>,
    state_file: Option<StateFile>,
    /// Mirror of the machine state, readable without the lifecycle lock
    status: AtomicU8,
    exec_gate: RwLock<()>,
    inner: Mutex<Inner>,
}

impl JailManager {
    pub fn new(
        config: EnvironmentConfig,
        settings: Arc<JailSettings>,
        backend: &Backend,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let root = settings.jail_path(&config.name);
        let state_file = settings
            .state_dir
            .as_deref()
            .map(|dir| StateFile::new(dir, &config.name));

        let inner = Inner {
            lifecycle: Lifecycle::new(),
            mounts: MountCoordinator::new(
                backend.mounter.clone(),
                UnmountPolicy::from(settings.as_ref()),
                sink.clone(),
            ),
            supervisor: ProcessSupervisor::new(backend.chroot.clone(), settings.stop_grace),
            started_at: None,
            last_error: None,
        };

        Self {
            config: Arc::new(config),
            settings,
            root,
            chroot: backend.chroot.clone(),
            sink,
            state_file,
            status: AtomicU8::new(JailStatus::Stopped as u8),
            exec_gate: RwLock::new(()),
            inner: Mutex::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Jail root directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn status(&self) -> JailStatus {
        JailStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// True if the jail root exists on disk
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Structural checks, performed before any OS action
    pub fn validate_config(&self) -> Result<()> {
        self.config.validate()?;
        if has_parent_segment(&self.settings.base_path) {
            return Err(Error::ConfigValidation(format!(
                "base path contains invalid directory traversal: {}",
                self.settings.base_path.display()
            )));
        }
        Ok(())
    }

    /// Consistent snapshot of the jail
    pub fn runtime_info(&self) -> JailRuntimeInfo {
        let inner = self.lock();
        let status = inner.lifecycle.status();
        JailRuntimeInfo {
            name: self.config.name.clone(),
            status,
            pid: match status {
                JailStatus::Running => inner.supervisor.service_pid().map(Pid::as_raw),
                _ => None,
            },
            ssh_port: self.config.ssh.port,
            listen_address: self.config.ssh.listen_address.clone(),
            started_at: inner.started_at,
            mounts: inner.mounts.active().to_vec(),
            last_error: inner.last_error.clone(),
            path: self.root.clone(),
        }
    }

    /// Build the jail root
    ///
    /// Leaves partial state behind on failure; running it again completes
    /// the tree. Does not change the status.
    pub fn create(&self) -> Result<()> {
        let mut inner = self.lock();

        if let Err(e) = self.validate_config() {
            return Err(self.record(&mut inner, "create", e));
        }
        if layout::is_provisioned(&self.root) {
            let err = Error::JailAlreadyExists(self.config.name.clone());
            return Err(self.record(&mut inner, "create", err));
        }

        self.sink.info(LOG, &format!("Creating jail '{}'", self.config.name));
        match Provisioner::new(&self.config, &self.root, self.sink.as_ref()).provision() {
            Ok(()) => {
                self.sink
                    .info(LOG, &format!("Jail '{}' created at {}", self.config.name, self.root.display()));
                Ok(())
            }
            Err(e) => Err(self.record(&mut inner, "create", e)),
        }
    }

    /// Mount, launch the service and run the init script
    ///
    /// A failure leaves whatever was established in place with status ERROR;
    /// `stop` or `destroy` cleans it up.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();

        match inner.lifecycle.status() {
            JailStatus::Running => {
                self.sink
                    .warning(LOG, &format!("Jail '{}' is already running", self.config.name));
                return Ok(());
            }
            JailStatus::Error => {
                let err = Error::InvalidState {
                    name: self.config.name.clone(),
                    action: "start",
                    status: JailStatus::Error,
                };
                return Err(self.record(&mut inner, "start", err));
            }
            _ => {}
        }

        if let Err(e) = self.validate_config() {
            return Err(self.record(&mut inner, "start", e));
        }
        if !self.exists() {
            let err = Error::JailNotCreated {
                name: self.config.name.clone(),
                path: self.root.clone(),
            };
            return Err(self.record(&mut inner, "start", err));
        }

        if let Err(e) = self.fire(&mut inner, Transition::Start) {
            return Err(self.record(&mut inner, "start", e));
        }
        self.sink.info(LOG, &format!("Starting jail '{}'", self.config.name));

        let result = self.bring_up(&mut inner);
        let result = result.and_then(|()| self.fire(&mut inner, Transition::Started));

        match result {
            Ok(()) => {
                inner.started_at = Some(SystemTime::now());
                inner.last_error = None;
                self.persist(&inner);
                self.sink.info(
                    LOG,
                    &format!(
                        "Jail '{}' running, SSH on {}:{}",
                        self.config.name, self.config.ssh.listen_address, self.config.ssh.port
                    ),
                );
                Ok(())
            }
            Err(e) => {
                let _ = self.fire(&mut inner, Transition::Fail);
                let err = self.record(&mut inner, "start", e);
                self.persist(&inner);
                Err(err)
            }
        }
    }

    fn bring_up(&self, inner: &mut Inner) -> Result<()> {
        let limiter = ResourceLimiter::new(&self.config.limits);
        self.sink.debug(
            "limits",
            &format!("Resource limits for '{}': {}", self.config.name, limiter),
        );

        let mut records = mounts::fixed_mounts(&self.root);
        for spec in &self.config.mounts {
            records.push(mounts::configured_mount(&self.root, spec)?);
        }
        inner.mounts.mount_all(&self.root, records)?;

        let command = supervisor::service_command(&self.config, limiter.clone());
        let pid = inner.supervisor.start_service(&self.root, &command)?;
        self.sink.info(
            "process",
            &format!("Started '{}' as pid {}", command.display(), pid),
        );

        if !self.script_present(INIT_SCRIPT) {
            self.sink.warning(
                LOG,
                &format!("Jail '{}' has no init script, skipping it", self.config.name),
            );
            return Ok(());
        }
        let outcome = inner.supervisor.run_script(
            &self.root,
            INIT_SCRIPT,
            supervisor::jail_env(&self.config),
            Some(limiter),
        )?;
        if !outcome.success() {
            return Err(Error::ScriptFailed {
                script: "init",
                outcome,
            });
        }
        Ok(())
    }

    /// Terminate the service, run the cleanup script and unmount everything
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        self.stop_locked(&mut inner)
    }

    fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.lifecycle.status() == JailStatus::Stopped {
            return Ok(());
        }

        // Publishes STOPPING, so executes arriving from here on fail fast
        if let Err(e) = self.fire(inner, Transition::Stop) {
            return Err(self.record(inner, "stop", e));
        }
        self.sink.info(LOG, &format!("Stopping jail '{}'", self.config.name));

        let mut failure = None;
        match inner.supervisor.stop_service() {
            Ok(Some(outcome)) => self
                .sink
                .debug("process", &format!("Service exited: {}", outcome)),
            Ok(None) => {}
            Err(e) => {
                self.sink
                    .error("process", &format!("Failed to stop service: {}", e));
                failure = Some(e);
            }
        }

        let report = {
            let _gate = self
                .exec_gate
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            self.run_cleanup(inner);
            inner.mounts.unmount_all()
        };

        let abandoned = report.describe_abandoned();
        if let Some(message) = &abandoned {
            self.sink
                .warning(LOG, &format!("Jail '{}': {}", self.config.name, message));
        }

        let result = match failure {
            None => self.fire(inner, Transition::Stopped),
            Some(e) => Err(e),
        };

        match result {
            Ok(()) => {
                inner.started_at = None;
                inner.last_error = abandoned;
                self.persist(inner);
                self.sink.info(LOG, &format!("Jail '{}' stopped", self.config.name));
                Ok(())
            }
            Err(e) => {
                let _ = self.fire(inner, Transition::Fail);
                let err = self.record(inner, "stop", e);
                self.persist(inner);
                Err(err)
            }
        }
    }

    /// True if the in-jail script exists as a regular file
    fn script_present(&self, script: &str) -> bool {
        self.root.join(script.trim_start_matches('/')).is_file()
    }

    fn run_cleanup(&self, inner: &Inner) {
        if !self.script_present(CLEANUP_SCRIPT) {
            return;
        }
        match inner.supervisor.run_script(
            &self.root,
            CLEANUP_SCRIPT,
            supervisor::jail_env(&self.config),
            None,
        ) {
            Ok(outcome) if outcome.success() => {}
            Ok(outcome) => self
                .sink
                .warning(LOG, &format!("cleanup script failed: {}", outcome)),
            Err(e) => self.sink.warning(LOG, &format!("cleanup script failed: {}", e)),
        }
    }

    /// Stop the jail and delete its root
    ///
    /// Deletion is refused while anything is still mounted under the root.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.lock();
        self.sink.info(LOG, &format!("Destroying jail '{}'", self.config.name));

        let stopped = self.stop_locked(&mut inner);

        let report = inner.mounts.unmount_all();
        if let Some(message) = report.describe_abandoned() {
            self.sink.warning(LOG, &message);
        }

        let removed = self.remove_tree(&inner.mounts);
        match &removed {
            Ok(()) => {
                if let Some(file) = &self.state_file {
                    if let Err(e) = file.clear() {
                        self.sink.warning(LOG, &e.to_string());
                    }
                }
                self.sink
                    .info(LOG, &format!("Jail '{}' destroyed", self.config.name));
            }
            Err(e) => {
                let message = e.to_string();
                self.sink.error(LOG, &format!("destroy '{}': {}", self.config.name, message));
                inner.last_error = Some(message);
            }
        }

        stopped.and(removed)
    }

    fn remove_tree(&self, mounts: &MountCoordinator) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }

        let remaining = mounts.sweep(&self.root)?;
        if !remaining.is_empty() {
            return Err(Error::MountsRemain {
                root: self.root.clone(),
                mounts: remaining,
            });
        }

        fs::remove_dir_all(&self.root).map_err(|e| Error::RemoveFailed {
            path: self.root.clone(),
            source: e,
        })
    }

    /// Run a shell command inside the running jail and wait for it
    pub fn execute(&self, command: &str) -> Result<ExitOutcome> {
        if self.status() != JailStatus::Running {
            return Err(self.not_running());
        }

        let _gate = self
            .exec_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        // A stop may have begun while waiting for the gate
        if self.status() != JailStatus::Running {
            return Err(self.not_running());
        }

        self.sink.debug(
            "process",
            &format!("Executing in '{}': {}", self.config.name, command),
        );
        let outcome = supervisor::one_shot(
            self.chroot.as_ref(),
            &self.root,
            command,
            supervisor::jail_env(&self.config),
        )?;
        self.sink.debug("process", &outcome.to_string());
        Ok(outcome)
    }

    /// Pick up state left by an earlier process
    pub fn restore(&self) -> Result<()> {
        let Some(file) = &self.state_file else {
            return Ok(());
        };
        let Some(record) = file.load()? else {
            return Ok(());
        };

        let mut inner = self.lock();
        inner.mounts.adopt(record.mounts);

        // A recorded pid that died or was reused is never adopted, so stop
        // cannot signal an unrelated process
        let service = record
            .pid
            .map(Pid::from_raw)
            .filter(|pid| self.chroot.is_jailed(*pid, &self.root));

        let status = match service {
            Some(pid) => {
                inner.supervisor.adopt(pid);
                inner.started_at = record.started_at;
                JailStatus::Running
            }
            None => {
                inner.last_error = Some(match record.pid {
                    Some(pid) => format!("service (pid {}) exited while unsupervised", pid),
                    None => "mounts left behind by a failed start".to_string(),
                });
                JailStatus::Error
            }
        };

        inner.lifecycle = Lifecycle::resume(status);
        self.status.store(status as u8, Ordering::SeqCst);
        self.sink.debug(
            LOG,
            &format!("Restored jail '{}' as {}", self.config.name, status),
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, inner: &mut Inner, transition: Transition) -> Result<()> {
        let from = inner.lifecycle.status();
        let to = inner
            .lifecycle
            .fire(transition)
            .map_err(|reason| Error::InvalidTransition {
                name: self.config.name.clone(),
                status: from,
                reason,
            })?;
        self.status.store(to as u8, Ordering::SeqCst);
        self.sink.debug(
            LOG,
            &format!("Jail '{}': {} -> {}", self.config.name, from, to),
        );
        Ok(())
    }

    /// Log an operation failure and keep it as the last error
    fn record(&self, inner: &mut Inner, action: &str, err: Error) -> Error {
        let message = err.to_string();
        self.sink
            .error(LOG, &format!("{} '{}' failed: {}", action, self.config.name, message));
        inner.last_error = Some(message);
        err
    }

    fn not_running(&self) -> Error {
        self.sink.warning(
            LOG,
            &format!("Jail '{}' is not running ({})", self.config.name, self.status()),
        );
        Error::JailNotRunning(self.config.name.clone())
    }

    fn persist(&self, inner: &Inner) {
        let Some(file) = &self.state_file else {
            return;
        };
        let record = RuntimeRecord {
            pid: inner.supervisor.service_pid().map(Pid::as_raw),
            started_at: inner.started_at,
            mounts: inner.mounts.active().to_vec(),
        };
        if let Err(e) = file.save(&record) {
            self.sink.warning(LOG, &format!("Cannot save runtime state: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::logging::MemorySink;
    use crate::manifest::UserConfig;
    use crate::testing::{ChrootCall, FakeChroot, FakeMounter};
    use nix::errno::Errno;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _base: TempDir,
        mounter: Arc<FakeMounter>,
        chroot: Arc<FakeChroot>,
        sink: Arc<MemorySink>,
        settings: Arc<JailSettings>,
    }

    impl Harness {
        fn new() -> Self {
            let base = tempfile::tempdir().unwrap();
            let settings = JailSettings::new(base.path())
                .with_unmount_delay(Duration::from_millis(1));
            Self {
                settings: Arc::new(settings),
                _base: base,
                mounter: Arc::new(FakeMounter::new()),
                chroot: Arc::new(FakeChroot::new()),
                sink: Arc::new(MemorySink::new()),
            }
        }

        fn with_state_dir(mut self) -> Self {
            let dir = self._base.path().join("run");
            self.settings = Arc::new((*self.settings).clone().with_state_dir(dir));
            self
        }

        fn backend(&self) -> Backend {
            Backend::new(self.mounter.clone(), self.chroot.clone())
        }

        fn manager(&self, config: EnvironmentConfig) -> JailManager {
            JailManager::new(config, self.settings.clone(), &self.backend(), self.sink.clone())
        }

        /// Manager whose root holds only the init script, skipping full provisioning
        fn prepared(&self, name: &str) -> JailManager {
            let manager = self.manager(EnvironmentConfig::new(name).port(2201));
            let script = manager.path().join(INIT_SCRIPT.trim_start_matches('/'));
            fs::create_dir_all(script.parent().unwrap()).unwrap();
            fs::write(&script, "#!/bin/sh\n").unwrap();
            manager
        }
    }

    #[test]
    fn test_path_derived_from_name() {
        let h = Harness::new();
        let manager = h.manager(EnvironmentConfig::new("dev"));
        assert_eq!(manager.path(), h.settings.base_path.join("jails/dev"));
        assert!(!manager.exists());
        assert_eq!(manager.status(), JailStatus::Stopped);
    }

    #[test]
    fn test_start_without_root_keeps_stopped() {
        let h = Harness::new();
        let manager = h.manager(EnvironmentConfig::new("dev"));

        let err = manager.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotCreated);
        assert_eq!(manager.status(), JailStatus::Stopped);
        assert!(h.mounter.mount_calls().is_empty());
        assert!(manager.runtime_info().last_error.is_some());
    }

    #[test]
    fn test_start_runs_full_sequence() {
        let h = Harness::new();
        let manager = h.prepared("dev");

        manager.start().unwrap();
        assert_eq!(manager.status(), JailStatus::Running);

        let info = manager.runtime_info();
        assert_eq!(info.status, JailStatus::Running);
        assert_eq!(info.mounts.len(), 4);
        assert_eq!(info.ssh_port, 2201);
        assert!(info.pid.is_some());
        assert!(info.started_at.is_some());

        let calls = h.chroot.calls();
        assert!(matches!(&calls[0], ChrootCall::Spawn { program, .. } if program == "/usr/sbin/sshd"));
        assert!(matches!(&calls[1], ChrootCall::Run { args, .. } if args == &vec![INIT_SCRIPT.to_string()]));
    }

    #[test]
    fn test_start_twice_is_idempotent() {
        let h = Harness::new();
        let manager = h.prepared("dev");

        manager.start().unwrap();
        manager.start().unwrap();

        assert_eq!(h.mounter.mount_calls().len(), 4);
        let spawns = h
            .chroot
            .calls()
            .iter()
            .filter(|c| matches!(c, ChrootCall::Spawn { .. }))
            .count();
        assert_eq!(spawns, 1);
        assert!(h.sink.contains("already running"));
    }

    #[test]
    fn test_concurrent_starts_serialize() {
        let h = Harness::new();
        let manager = Arc::new(h.prepared("dev"));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.start())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(manager.status(), JailStatus::Running);
        assert_eq!(h.mounter.mount_calls().len(), 4);
    }

    #[test]
    fn test_mount_failure_leaves_error_without_rollback() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        h.mounter.fail_mount(manager.path().join("dev/pts"), Errno::EPERM);

        let err = manager.start().unwrap_err();
        assert!(matches!(err, Error::MountFailed { .. }));
        assert_eq!(manager.status(), JailStatus::Error);

        let info = manager.runtime_info();
        assert_eq!(info.mounts.len(), 2);
        assert!(info.pid.is_none());
        assert!(info.last_error.unwrap().contains("dev/pts"));
        assert!(h.mounter.unmount_calls().is_empty());

        // Start from ERROR is rejected; stop recovers
        assert_eq!(manager.start().unwrap_err().kind(), ErrorKind::InvalidState);
        manager.stop().unwrap();
        assert_eq!(manager.status(), JailStatus::Stopped);
        assert_eq!(
            h.mounter.unmount_calls(),
            vec![manager.path().join("sys"), manager.path().join("proc")]
        );
    }

    #[test]
    fn test_init_script_failure_sets_error() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        h.chroot.script_outcome(INIT_SCRIPT, ExitOutcome::Exited(3));

        let err = manager.start().unwrap_err();
        assert!(matches!(err, Error::ScriptFailed { script: "init", .. }));
        assert_eq!(manager.status(), JailStatus::Error);
        // Service stays tracked for cleanup but is not reported
        assert!(manager.runtime_info().pid.is_none());

        manager.stop().unwrap();
        assert!(
            h.chroot
                .calls()
                .iter()
                .any(|c| matches!(c, ChrootCall::Terminate(_)))
        );
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        manager.stop().unwrap();
        assert!(h.chroot.calls().is_empty());
        assert!(h.mounter.unmount_calls().is_empty());
    }

    #[test]
    fn test_stop_unmounts_in_reverse() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        manager.start().unwrap();
        manager.stop().unwrap();

        let root = manager.path();
        assert_eq!(
            h.mounter.unmount_calls(),
            vec![
                root.join("tmp"),
                root.join("dev/pts"),
                root.join("sys"),
                root.join("proc"),
            ]
        );
        let info = manager.runtime_info();
        assert_eq!(info.status, JailStatus::Stopped);
        assert!(info.mounts.is_empty());
        assert!(info.pid.is_none());
        assert!(info.started_at.is_none());
    }

    #[test]
    fn test_stop_gives_up_on_busy_mount_but_stops() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        manager.start().unwrap();
        h.mounter.busy_for(manager.path().join("sys"), u32::MAX);

        manager.stop().unwrap();
        assert_eq!(manager.status(), JailStatus::Stopped);
        assert!(manager.runtime_info().last_error.unwrap().contains("sys"));
        // proc was still unmounted after sys was given up on
        assert!(h.mounter.unmount_calls().contains(&manager.path().join("proc")));
    }

    #[test]
    fn test_stop_signal_failure_still_unmounts() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        manager.start().unwrap();
        h.chroot.fail_terminate(Errno::EPERM);

        let err = manager.stop().unwrap_err();
        assert!(matches!(err, Error::SignalFailed { .. }));
        assert_eq!(manager.status(), JailStatus::Error);
        assert_eq!(h.mounter.unmount_calls().len(), 4);
    }

    #[test]
    fn test_cleanup_script_failure_is_best_effort() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        let script = manager.path().join("usr/share/agi/cleanup.sh");
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
        h.chroot.script_outcome(CLEANUP_SCRIPT, ExitOutcome::Exited(1));

        manager.start().unwrap();
        manager.stop().unwrap();
        assert_eq!(manager.status(), JailStatus::Stopped);
        assert!(h.sink.contains("cleanup script failed"));
    }

    #[test]
    fn test_execute_requires_running() {
        let h = Harness::new();
        let manager = h.prepared("dev");

        let err = manager.execute("echo hi").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        assert!(h.chroot.calls().is_empty());
    }

    #[test]
    fn test_execute_reports_outcome() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        manager.start().unwrap();

        h.chroot.script_outcome("exit 2", ExitOutcome::Exited(2));
        assert_eq!(manager.execute("echo hi").unwrap(), ExitOutcome::Exited(0));
        let outcome = manager.execute("exit 2").unwrap();
        assert_eq!(outcome.to_string(), "Command execution failed (exit code: 2)");
        assert!(matches!(manager.execute(""), Err(Error::EmptyCommand)));

        manager.stop().unwrap();
        assert_eq!(manager.execute("echo hi").unwrap_err().kind(), ErrorKind::NotRunning);
    }

    #[test]
    fn test_destroy_running_jail() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        manager.start().unwrap();
        let pid = manager.runtime_info().pid.unwrap();

        manager.destroy().unwrap();
        assert!(!manager.exists());
        assert_eq!(manager.status(), JailStatus::Stopped);
        assert!(h.chroot.calls().contains(&ChrootCall::Terminate(Pid::from_raw(pid))));
        assert_eq!(h.mounter.unmount_calls().len(), 4);
    }

    #[test]
    fn test_destroy_refuses_with_live_mounts() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        let root = manager.path().canonicalize().unwrap();
        h.mounter.add_to_table(root.join("tmp"));
        h.mounter.busy_for(root.join("tmp"), u32::MAX);

        let err = manager.destroy().unwrap_err();
        assert!(matches!(err, Error::MountsRemain { .. }));
        assert!(manager.exists());
    }

    #[test]
    fn test_create_builds_tree() {
        let h = Harness::new();
        let manager = h.manager(EnvironmentConfig::new("dev").port(2201));

        manager.create().unwrap();
        assert!(manager.exists());
        for rel in layout::SKELETON {
            assert!(manager.path().join(rel).is_dir(), "missing {}", rel);
        }
        assert!(manager.path().join("bin/sh").is_file());
        assert_eq!(manager.status(), JailStatus::Stopped);

        let err = manager.create().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_invalid_config_rejected_before_os_action() {
        let h = Harness::new();
        let manager = h.manager(EnvironmentConfig::new("dev").port(0));

        assert_eq!(manager.create().unwrap_err().kind(), ErrorKind::Config);
        assert!(!manager.exists());
        fs::create_dir_all(manager.path()).unwrap();
        assert_eq!(manager.start().unwrap_err().kind(), ErrorKind::Config);
        assert!(h.mounter.mount_calls().is_empty());
    }

    #[test]
    fn test_state_restored_by_new_manager() {
        let h = Harness::new().with_state_dir();
        let manager = h.prepared("dev");
        manager.start().unwrap();
        let pid = manager.runtime_info().pid;

        let again = h.manager(EnvironmentConfig::new("dev").port(2201));
        again.restore().unwrap();
        assert_eq!(again.status(), JailStatus::Running);
        assert_eq!(again.runtime_info().pid, pid);
        assert_eq!(again.runtime_info().mounts.len(), 4);

        again.stop().unwrap();
        let fresh = h.manager(EnvironmentConfig::new("dev").port(2201));
        fresh.restore().unwrap();
        assert_eq!(fresh.status(), JailStatus::Stopped);
    }

    #[test]
    fn test_restore_with_dead_service_is_error() {
        let h = Harness::new().with_state_dir();
        let manager = h.prepared("dev");
        manager.start().unwrap();
        let pid = manager.runtime_info().pid.unwrap();
        h.chroot.exit(Pid::from_raw(pid));

        let again = h.manager(EnvironmentConfig::new("dev").port(2201));
        again.restore().unwrap();
        assert_eq!(again.status(), JailStatus::Error);
        assert!(again.runtime_info().last_error.unwrap().contains("unsupervised"));

        again.stop().unwrap();
        assert_eq!(again.status(), JailStatus::Stopped);
    }

    #[test]
    fn test_missing_init_script_is_skipped() {
        let h = Harness::new();
        let manager = h.manager(EnvironmentConfig::new("dev").port(2201));
        fs::create_dir_all(manager.path()).unwrap();

        manager.start().unwrap();
        assert_eq!(manager.status(), JailStatus::Running);
        assert!(
            !h.chroot
                .calls()
                .iter()
                .any(|c| matches!(c, ChrootCall::Run { .. }))
        );
        assert!(h.sink.contains("no init script"));
    }

    #[test]
    fn test_start_refuses_symlinked_mount_point() {
        let h = Harness::new();
        let manager = h.prepared("dev");
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), manager.path().join("tmp")).unwrap();

        let err = manager.start().unwrap_err();
        assert!(matches!(err, Error::MountEscape { .. }));
        assert_eq!(manager.status(), JailStatus::Error);
        assert!(!h.mounter.mount_calls().contains(&manager.path().join("tmp")));
        // Nothing was launched
        assert!(h.chroot.calls().is_empty());

        manager.stop().unwrap();
        assert_eq!(h.mounter.unmount_calls().len(), 3);
    }

    #[test]
    fn test_create_rejects_user_outside_jail() {
        let h = Harness::new();
        let mut config = EnvironmentConfig::new("dev").port(2201);
        config.users.push(UserConfig {
            name: "../../../escaped".into(),
            shell: "/bin/sh".into(),
            home: "/home".into(),
            sudo: false,
        });
        let manager = h.manager(config);

        assert_eq!(manager.create().unwrap_err().kind(), ErrorKind::Config);
        assert!(!manager.exists());
        assert!(!h.settings.base_path.join("escaped").exists());
    }

    #[test]
    fn test_stop_waits_for_in_flight_execute() {
        let h = Harness::new();
        let manager = Arc::new(h.prepared("dev"));
        manager.start().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        h.chroot.pause_runs("long-task", barrier.clone());

        let exec = {
            let manager = manager.clone();
            thread::spawn(move || manager.execute("long-task"))
        };
        // The command is now running inside the jail
        barrier.wait();

        let stop = {
            let manager = manager.clone();
            thread::spawn(move || manager.stop())
        };
        while manager.status() != JailStatus::Stopping {
            thread::sleep(Duration::from_millis(1));
        }

        // Commands arriving during teardown fail fast
        let err = manager.execute("echo late").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);

        thread::sleep(Duration::from_millis(50));
        assert!(h.mounter.unmount_calls().is_empty());
        assert!(!stop.is_finished());

        barrier.wait();
        assert_eq!(exec.join().unwrap().unwrap(), ExitOutcome::Exited(0));
        stop.join().unwrap().unwrap();
        assert_eq!(manager.status(), JailStatus::Stopped);
        assert_eq!(h.mounter.unmount_calls().len(), 4);
    }

    fn write_state(h: &Harness, name: &str, pid: i32) {
        let dir = h.settings.state_dir.clone().unwrap();
        let record = RuntimeRecord {
            pid: Some(pid),
            started_at: Some(SystemTime::now()),
            mounts: Vec::new(),
        };
        StateFile::new(&dir, name).save(&record).unwrap();
    }

    #[test]
    fn test_restore_ignores_pid_outside_jail() {
        let h = Harness::new().with_state_dir();
        let manager = h.prepared("dev");
        write_state(&h, "dev", 1);
        // pid 1 exists, but runs at the host root
        h.chroot.add_process(Pid::from_raw(1), PathBuf::from("/"));

        manager.restore().unwrap();
        assert_eq!(manager.status(), JailStatus::Error);
        assert!(manager.runtime_info().last_error.unwrap().contains("pid 1"));

        manager.stop().unwrap();
        assert_eq!(manager.status(), JailStatus::Stopped);
        assert!(
            !h.chroot
                .calls()
                .iter()
                .any(|c| matches!(c, ChrootCall::Terminate(_)))
        );
    }

    #[test]
    fn test_restore_checks_real_process_root() {
        let h = Harness::new().with_state_dir();
        let backend = Backend::new(h.mounter.clone(), Arc::new(SystemChroot));
        let manager = JailManager::new(
            EnvironmentConfig::new("dev").port(2201),
            h.settings.clone(),
            &backend,
            h.sink.clone(),
        );
        fs::create_dir_all(manager.path()).unwrap();
        write_state(&h, "dev", 1);

        manager.restore().unwrap();
        assert_eq!(manager.status(), JailStatus::Error);
        assert_eq!(manager.runtime_info().pid, None);
    }
}
