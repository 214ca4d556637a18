//! Supervision of the in-jail SSH service and script execution

use crate::error::{Error, Result};
use crate::jail::chroot::{Chroot, ChrootCommand};
use crate::jail::limits::ResourceLimiter;
use crate::jail::types::ExitOutcome;
use crate::manifest::EnvironmentConfig;
use nix::unistd::Pid;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// In-jail path of the script run at the end of start
pub const INIT_SCRIPT: &str = "/usr/share/agi/init.sh";

/// In-jail path of the script run during stop
pub const CLEANUP_SCRIPT: &str = "/usr/share/agi/cleanup.sh";

/// PATH every jailed process gets
pub const JAIL_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Environment for processes inside the jail
pub fn jail_env(config: &EnvironmentConfig) -> Vec<(String, String)> {
    let mut env = vec![
        ("PATH".to_string(), JAIL_PATH.to_string()),
        ("HOME".to_string(), "/root".to_string()),
    ];
    for (key, value) in &config.environment {
        env.retain(|(k, _)| k != key);
        env.push((key.clone(), value.clone()));
    }
    env
}

/// The SSH daemon, kept in the foreground so its pid is the one tracked
pub fn service_command(config: &EnvironmentConfig, limits: ResourceLimiter) -> ChrootCommand {
    ChrootCommand::new(config.ssh.daemon.to_string_lossy())
        .args(["-D", "-f", "/etc/ssh/sshd_config", "-E", "/var/log/sshd.log"])
        .envs(jail_env(config))
        .limits(limits)
        .detached()
}

/// Run an arbitrary command line through the jail's shell
pub fn one_shot(
    chroot: &dyn Chroot,
    root: &Path,
    command: &str,
    env: Vec<(String, String)>,
) -> Result<ExitOutcome> {
    if command.trim().is_empty() {
        return Err(Error::EmptyCommand);
    }
    let cmd = ChrootCommand::new("/bin/sh").arg("-c").arg(command).envs(env);
    chroot.run(root, &cmd)
}

/// Tracks the service process of one jail
pub struct ProcessSupervisor {
    chroot: Arc<dyn Chroot>,
    service: Option<Pid>,
    grace: Option<Duration>,
}

impl ProcessSupervisor {
    pub fn new(chroot: Arc<dyn Chroot>, grace: Option<Duration>) -> Self {
        Self {
            chroot,
            service: None,
            grace,
        }
    }

    pub fn service_pid(&self) -> Option<Pid> {
        self.service
    }

    /// Track a service started by an earlier process
    pub fn adopt(&mut self, pid: Pid) {
        self.service = Some(pid);
    }

    /// Fork, chroot and exec the service
    pub fn start_service(&mut self, root: &Path, command: &ChrootCommand) -> Result<Pid> {
        let pid = self.chroot.spawn(root, command)?;
        self.service = Some(pid);
        Ok(pid)
    }

    /// Terminate the service and wait for it; no-op if none is tracked
    ///
    /// The pid is forgotten even when signalling fails.
    pub fn stop_service(&mut self) -> Result<Option<ExitOutcome>> {
        match self.service.take() {
            Some(pid) => self.chroot.terminate(pid, self.grace),
            None => Ok(None),
        }
    }

    /// Run a script inside the jail with `/bin/sh`
    pub fn run_script(
        &self,
        root: &Path,
        script: &str,
        env: Vec<(String, String)>,
        limits: Option<ResourceLimiter>,
    ) -> Result<ExitOutcome> {
        let mut cmd = ChrootCommand::new("/bin/sh").arg(script).envs(env);
        cmd.limits = limits;
        self.chroot.run(root, &cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChrootCall, FakeChroot};

    #[test]
    fn test_env_contains_path_home_and_overrides() {
        let mut config = EnvironmentConfig::new("dev");
        config.environment.insert("LANG".into(), "C.UTF-8".into());
        config.environment.insert("HOME".into(), "/home/dev".into());

        let env = jail_env(&config);
        assert!(env.contains(&("PATH".to_string(), JAIL_PATH.to_string())));
        assert!(env.contains(&("HOME".to_string(), "/home/dev".to_string())));
        assert!(env.contains(&("LANG".to_string(), "C.UTF-8".to_string())));
        assert_eq!(env.iter().filter(|(k, _)| k == "HOME").count(), 1);
    }

    #[test]
    fn test_service_command_runs_in_foreground() {
        let config = EnvironmentConfig::new("dev");
        let cmd = service_command(&config, ResourceLimiter::default());
        assert_eq!(cmd.program, "/usr/sbin/sshd");
        assert_eq!(cmd.args[0], "-D");
        assert!(cmd.detach);
    }

    #[test]
    fn test_start_and_stop_service() {
        let chroot = Arc::new(FakeChroot::new());
        let mut supervisor = ProcessSupervisor::new(chroot.clone(), None);
        let root = Path::new("/jails/dev");

        let pid = supervisor
            .start_service(root, &service_command(&EnvironmentConfig::new("dev"), ResourceLimiter::default()))
            .unwrap();
        assert_eq!(supervisor.service_pid(), Some(pid));
        assert!(chroot.is_jailed(pid, root));
        assert!(!chroot.is_jailed(pid, Path::new("/jails/other")));

        supervisor.stop_service().unwrap();
        assert_eq!(supervisor.service_pid(), None);
        assert!(chroot.calls().contains(&ChrootCall::Terminate(pid)));

        // Second stop has nothing to do
        assert!(supervisor.stop_service().unwrap().is_none());
    }

    #[test]
    fn test_one_shot_rejects_empty_command() {
        let chroot = FakeChroot::new();
        let err = one_shot(&chroot, Path::new("/jails/dev"), "   ", Vec::new()).unwrap_err();
        assert!(matches!(err, Error::EmptyCommand));
        assert!(chroot.calls().is_empty());
    }
}
