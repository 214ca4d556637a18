//! Configuration file parsing for agi
//!
//! Parses `agi.toml` configuration files using serde. The jail engine only
//! consumes validated records; loading and validation live here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/agi/agi.toml";

/// Host paths that may never be mounted into a jail
const FORBIDDEN_MOUNT_SOURCES: &[&str] = &["/etc", "/var/lib", "/var/run"];

/// Load configuration from a file
pub fn load(path: &Path) -> Result<AgiConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: AgiConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AgiConfig {
    /// Global configuration settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Environment definitions
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

impl AgiConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.global.base_path.as_os_str().is_empty() {
            return Err(Error::ConfigValidation("base_path cannot be empty".into()));
        }
        if has_parent_segment(&self.global.base_path) {
            return Err(Error::ConfigValidation(format!(
                "base_path contains invalid directory traversal: {}",
                self.global.base_path.display()
            )));
        }
        if self.global.unmount.attempts == 0 {
            return Err(Error::ConfigValidation(
                "unmount.attempts must be at least 1".into(),
            ));
        }

        // Check for duplicate environment names
        let mut names = HashSet::new();
        for env in &self.environments {
            if !names.insert(env.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate environment name: {}",
                    env.name
                )));
            }
        }

        for env in &self.environments {
            env.validate()?;

            if env.ssh.listen_address.parse::<IpAddr>().is_err() {
                return Err(Error::ConfigValidation(format!(
                    "Environment '{}': invalid listen address '{}'",
                    env.name, env.ssh.listen_address
                )));
            }

            for mount in &env.mounts {
                if let Some(bad) = FORBIDDEN_MOUNT_SOURCES
                    .iter()
                    .find(|bad| Path::new(&mount.source).starts_with(bad))
                {
                    return Err(Error::ConfigValidation(format!(
                        "Environment '{}': mounting {} is forbidden (under {})",
                        env.name, mount.source, bad
                    )));
                }
            }
        }

        Ok(())
    }

    /// Get an environment definition by name
    pub fn get_environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }
}

/// Global configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Directory under which `jails/<name>` roots are created
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Directory receiving `agi.log`
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds to wait for the service after SIGTERM before SIGKILL (unset = wait forever)
    #[serde(default)]
    pub stop_grace_secs: Option<u64>,

    /// Busy-unmount retry policy
    #[serde(default)]
    pub unmount: UnmountConfig,
}

impl GlobalConfig {
    /// Directory holding per-jail runtime state files
    pub fn state_dir(&self) -> PathBuf {
        self.base_path.join("run")
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            log_path: default_log_path(),
            log_level: default_log_level(),
            stop_grace_secs: None,
            unmount: UnmountConfig::default(),
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("/var/lib/agi")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/agi")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Retry policy for unmounts that report EBUSY
#[derive(Debug, Clone, Deserialize)]
pub struct UnmountConfig {
    /// Total unmount attempts per target
    #[serde(default = "default_unmount_attempts")]
    pub attempts: u8,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_unmount_delay_ms")]
    pub base_delay_ms: u64,

    /// Delay multiplier between retries
    #[serde(default = "default_unmount_multiplier")]
    pub multiplier: f64,
}

impl Default for UnmountConfig {
    fn default() -> Self {
        Self {
            attempts: default_unmount_attempts(),
            base_delay_ms: default_unmount_delay_ms(),
            multiplier: default_unmount_multiplier(),
        }
    }
}

fn default_unmount_attempts() -> u8 {
    3
}

fn default_unmount_delay_ms() -> u64 {
    100
}

fn default_unmount_multiplier() -> f64 {
    1.0
}

/// One isolated environment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    /// Unique name; also the jail directory name
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// OS template identifier
    #[serde(default = "default_os_template")]
    pub os_template: String,

    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// Disabled environments are skipped by the CLI
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub limits: ResourceLimits,

    /// Extra mounts, established after the fixed pseudo-filesystems
    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    /// Users allowed to log in through the jail's SSH daemon
    #[serde(default)]
    pub users: Vec<UserConfig>,

    /// Environment variables for the service and executed commands
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Host script copied into the jail as its init script
    #[serde(default)]
    pub init_script: Option<PathBuf>,

    /// Host script copied into the jail as its cleanup script
    #[serde(default)]
    pub cleanup_script: Option<PathBuf>,
}

impl EnvironmentConfig {
    /// Create an environment with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            os_template: default_os_template(),
            architecture: default_architecture(),
            enabled: true,
            ssh: SshConfig::default(),
            limits: ResourceLimits::default(),
            mounts: Vec::new(),
            users: Vec::new(),
            environment: BTreeMap::new(),
            init_script: None,
            cleanup_script: None,
        }
    }

    /// Set the SSH port
    pub fn port(mut self, port: u16) -> Self {
        self.ssh.port = port;
        self
    }

    /// Add a mount
    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.mounts.push(spec);
        self
    }

    /// Structural checks performed before any OS-level action
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ConfigValidation(
                "Environment name cannot be empty".into(),
            ));
        }

        // The jail root is <base>/jails/<name>, so the name must be one plain component
        if !is_single_component(&self.name) {
            return Err(Error::ConfigValidation(format!(
                "Environment name '{}' contains invalid directory traversal",
                self.name
            )));
        }

        if self.ssh.port == 0 {
            return Err(Error::ConfigValidation(
                "SSH port must be in range 1-65535".into(),
            ));
        }

        for mount in &self.mounts {
            if mount.source.is_empty() || mount.target.is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Environment '{}': mount source and target cannot be empty",
                    self.name
                )));
            }
            if has_parent_segment(Path::new(&mount.target)) {
                return Err(Error::ConfigValidation(format!(
                    "Environment '{}': mount target '{}' contains invalid directory traversal",
                    self.name, mount.target
                )));
            }
        }

        // Home directories are created at <root>/<home>/<name>
        for user in &self.users {
            if !is_single_component(&user.name) {
                return Err(Error::ConfigValidation(format!(
                    "Environment '{}': user name '{}' is not a plain name",
                    self.name, user.name
                )));
            }
            if has_parent_segment(Path::new(&user.home)) {
                return Err(Error::ConfigValidation(format!(
                    "Environment '{}': home '{}' of user '{}' contains invalid directory traversal",
                    self.name, user.home, user.name
                )));
            }
        }

        Ok(())
    }
}

/// True for a non-empty name that is exactly one normal path component
fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !name.contains('/')
}

fn default_os_template() -> String {
    "debian".to_string()
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

fn default_true() -> bool {
    true
}

/// SSH daemon settings for the in-jail service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Daemon binary, as seen from inside the jail
    #[serde(default = "default_daemon")]
    pub daemon: PathBuf,

    #[serde(default = "default_true")]
    pub password_auth: bool,

    #[serde(default = "default_true")]
    pub pubkey_auth: bool,

    #[serde(default = "default_true")]
    pub permit_root_login: bool,

    #[serde(default = "default_max_auth_tries")]
    pub max_auth_tries: u32,

    /// Keepalive interval in seconds
    #[serde(default = "default_client_alive_interval")]
    pub client_alive_interval: u32,

    #[serde(default)]
    pub client_alive_count_max: u32,

    /// Pre-authentication banner text
    #[serde(default)]
    pub banner: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            listen_address: default_listen_address(),
            daemon: default_daemon(),
            password_auth: true,
            pubkey_auth: true,
            permit_root_login: true,
            max_auth_tries: default_max_auth_tries(),
            client_alive_interval: default_client_alive_interval(),
            client_alive_count_max: 0,
            banner: None,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon() -> PathBuf {
    PathBuf::from("/usr/sbin/sshd")
}

fn default_max_auth_tries() -> u32 {
    3
}

fn default_client_alive_interval() -> u32 {
    300
}

/// POSIX resource ceilings for the jail's processes
///
/// A value of 0 leaves that limit untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceLimits {
    /// CPU time in seconds
    #[serde(default = "default_max_cpu_time")]
    pub max_cpu_time: u64,

    /// Address space in KB
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    /// Largest writable file in KB
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_max_processes")]
    pub max_processes: u64,

    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_time: default_max_cpu_time(),
            max_memory: default_max_memory(),
            max_file_size: default_max_file_size(),
            max_processes: default_max_processes(),
            max_open_files: default_max_open_files(),
        }
    }
}

fn default_max_cpu_time() -> u64 {
    300
}

fn default_max_memory() -> u64 {
    524_288
}

fn default_max_file_size() -> u64 {
    1_048_576
}

fn default_max_processes() -> u64 {
    64
}

fn default_max_open_files() -> u64 {
    256
}

/// An extra mount inside the jail
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MountSpec {
    /// Host path (or filesystem source for non-bind mounts)
    pub source: String,

    /// Path inside the jail
    pub target: String,

    /// Filesystem type; absent means bind mount
    #[serde(default)]
    pub fstype: Option<String>,

    #[serde(default)]
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: None,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// A user allowed into the jail
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub name: String,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_home")]
    pub home: String,

    #[serde(default)]
    pub sudo: bool,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_home() -> String {
    "/home".to_string()
}

/// Engine-facing settings shared by every jail in a registry
#[derive(Debug, Clone)]
pub struct JailSettings {
    /// Jail roots live at `<base_path>/jails/<name>`
    pub base_path: PathBuf,
    /// Total unmount attempts per target
    pub unmount_attempts: u8,
    /// Delay before the first unmount retry
    pub unmount_delay: Duration,
    /// Delay multiplier between unmount retries
    pub unmount_multiplier: f64,
    /// Wait bound for the service after SIGTERM; None blocks until exit
    pub stop_grace: Option<Duration>,
    /// Where runtime state files are kept; None disables persistence
    pub state_dir: Option<PathBuf>,
}

impl JailSettings {
    /// Settings with default policies and no persistence
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let unmount = UnmountConfig::default();
        Self {
            base_path: base_path.into(),
            unmount_attempts: unmount.attempts,
            unmount_delay: Duration::from_millis(unmount.base_delay_ms),
            unmount_multiplier: unmount.multiplier,
            stop_grace: None,
            state_dir: None,
        }
    }

    /// Enable runtime state persistence
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Bound the wait for the service on stop
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = Some(grace);
        self
    }

    /// Override the unmount retry delay
    pub fn with_unmount_delay(mut self, delay: Duration) -> Self {
        self.unmount_delay = delay;
        self
    }

    /// Root directory for a jail name
    pub fn jail_path(&self, name: &str) -> PathBuf {
        self.base_path.join("jails").join(name)
    }
}

impl From<&GlobalConfig> for JailSettings {
    fn from(global: &GlobalConfig) -> Self {
        Self {
            base_path: global.base_path.clone(),
            unmount_attempts: global.unmount.attempts,
            unmount_delay: Duration::from_millis(global.unmount.base_delay_ms),
            unmount_multiplier: global.unmount.multiplier,
            stop_grace: global.stop_grace_secs.map(Duration::from_secs),
            state_dir: Some(global.state_dir()),
        }
    }
}

/// True if `path` has a `..` component
pub fn has_parent_segment(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Template written by `agi init`
pub const DEFAULT_MANIFEST: &str = r#"# agi configuration

[global]
base_path = "/var/lib/agi"
log_path = "/var/log/agi"
log_level = "info"
# Seconds to wait for the SSH daemon after SIGTERM before SIGKILL
# stop_grace_secs = 10

[global.unmount]
attempts = 3
base_delay_ms = 100
multiplier = 1.0

[[environments]]
name = "dev-env"
description = "Development environment"
os_template = "debian"

[environments.ssh]
port = 2201
listen_address = "127.0.0.1"

[environments.limits]
max_cpu_time = 300
max_memory = 524288
max_file_size = 1048576
max_processes = 64
max_open_files = 256

# [[environments.mounts]]
# source = "/srv/shared"
# target = "/shared"
# read_only = true

# [[environments.users]]
# name = "dev"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest_parses_and_validates() {
        let config: AgiConfig = toml::from_str(DEFAULT_MANIFEST).unwrap();
        config.validate().unwrap();

        assert_eq!(config.global.base_path, PathBuf::from("/var/lib/agi"));
        assert_eq!(config.global.unmount.attempts, 3);
        let env = config.get_environment("dev-env").unwrap();
        assert_eq!(env.ssh.port, 2201);
        assert_eq!(env.limits.max_memory, 524_288);
        assert!(env.enabled);
    }

    #[test]
    fn test_minimal_environment_defaults() {
        let toml = r#"
[[environments]]
name = "box"
"#;
        let config: AgiConfig = toml::from_str(toml).unwrap();
        let env = &config.environments[0];
        assert_eq!(env.ssh.port, 22);
        assert_eq!(env.ssh.listen_address, "127.0.0.1");
        assert_eq!(env.ssh.daemon, PathBuf::from("/usr/sbin/sshd"));
        assert_eq!(env.limits.max_open_files, 256);
        assert_eq!(config.global.state_dir(), PathBuf::from("/var/lib/agi/run"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let toml = r#"
[[environments]]
name = "box"

[[environments]]
name = "box"
"#;
        let config: AgiConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate environment name"));
    }

    #[test]
    fn test_port_out_of_range_fails_to_parse() {
        let toml = r#"
[[environments]]
name = "box"
[environments.ssh]
port = 70000
"#;
        assert!(toml::from_str::<AgiConfig>(toml).is_err());
    }

    #[test]
    fn test_port_zero_rejected() {
        let env = EnvironmentConfig::new("box").port(0);
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_name_traversal_rejected() {
        for name in ["", "..", ".", "a/b", "../etc"] {
            let env = EnvironmentConfig::new(name);
            assert!(env.validate().is_err(), "name {:?} should be rejected", name);
        }
        assert!(EnvironmentConfig::new("dev-env").validate().is_ok());
    }

    #[test]
    fn test_mount_target_traversal_rejected() {
        let env = EnvironmentConfig::new("box").mount(MountSpec::bind("/srv", "/data/../../etc"));
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_user_paths_must_stay_in_jail() {
        let user = |name: &str, home: &str| UserConfig {
            name: name.into(),
            shell: "/bin/sh".into(),
            home: home.into(),
            sudo: false,
        };

        let mut env = EnvironmentConfig::new("box");
        env.users.push(user("alice", "/home"));
        assert!(env.validate().is_ok());

        for (name, home) in [
            ("../../../escaped", "/home"),
            ("a/b", "/home"),
            ("..", "/home"),
            ("", "/home"),
            ("alice", "/home/../../.."),
        ] {
            let mut env = EnvironmentConfig::new("box");
            env.users.push(user(name, home));
            let err = env.validate().unwrap_err();
            assert!(matches!(err, Error::ConfigValidation(_)), "{} {}", name, home);
        }
    }

    #[test]
    fn test_forbidden_mount_source_rejected() {
        let config = AgiConfig {
            global: GlobalConfig::default(),
            environments: vec![EnvironmentConfig::new("box").mount(MountSpec::bind("/etc/ssh", "/ssh"))],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn test_invalid_listen_address_rejected() {
        let mut env = EnvironmentConfig::new("box");
        env.ssh.listen_address = "not-an-ip".into();
        let config = AgiConfig {
            global: GlobalConfig::default(),
            environments: vec![env],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = load(Path::new("/nonexistent/agi.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn test_settings_from_global() {
        let global = GlobalConfig {
            stop_grace_secs: Some(5),
            ..GlobalConfig::default()
        };
        let settings = JailSettings::from(&global);
        assert_eq!(settings.stop_grace, Some(Duration::from_secs(5)));
        assert_eq!(settings.state_dir, Some(PathBuf::from("/var/lib/agi/run")));
        assert_eq!(
            settings.jail_path("dev"),
            PathBuf::from("/var/lib/agi/jails/dev")
        );
    }
}
