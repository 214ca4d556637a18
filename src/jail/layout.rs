//! Jail root provisioning
//!
//! Builds the directory skeleton, copies host binaries and their shared
//! libraries, creates device nodes, and writes the SSH daemon config and
//! lifecycle scripts.

use crate::error::{Error, Result};
use crate::logging::LogSink;
use crate::manifest::EnvironmentConfig;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

const LOG: &str = "layout";

/// Directories every jail root gets, relative to the root
pub const SKELETON: &[&str] = &[
    "data",
    "run",
    "bin",
    "sbin",
    "usr",
    "usr/bin",
    "usr/sbin",
    "lib",
    "lib64",
    "etc",
    "etc/ssh",
    "home",
    "root",
    "tmp",
    "var",
    "var/log",
    "var/run",
    "proc",
    "sys",
    "dev",
    "dev/pts",
    "usr/share/agi",
];

/// Libraries copied when `ldd` cannot be used
const FALLBACK_LIBRARIES: &[&str] = &[
    "/lib/x86_64-linux-gnu/libc.so.6",
    "/lib/x86_64-linux-gnu/libdl.so.2",
    "/lib/x86_64-linux-gnu/libtinfo.so.6",
    "/lib/x86_64-linux-gnu/libpthread.so.0",
    "/lib64/ld-linux-x86-64.so.2",
];

const OPTIONAL_BINARIES: &[&str] = &[
    "/bin/bash",
    "/bin/ls",
    "/bin/cat",
    "/bin/mkdir",
    "/bin/rm",
    "/bin/echo",
    "/bin/sleep",
    "/usr/bin/whoami",
];

/// Character devices: (name under dev/, major, minor)
const DEVICES: &[(&str, u64, u64)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

const SSHD_CONFIG: &str = "etc/ssh/sshd_config";
const BANNER: &str = "etc/ssh/banner";
const INIT_SCRIPT: &str = "usr/share/agi/init.sh";
const CLEANUP_SCRIPT: &str = "usr/share/agi/cleanup.sh";

/// A host file to copy into the jail at the same path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub path: PathBuf,
    /// Missing mandatory assets abort provisioning
    pub mandatory: bool,
    /// Executables get mode 0755 and have their libraries discovered
    pub executable: bool,
}

impl Asset {
    pub fn mandatory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mandatory: true,
            executable: true,
        }
    }

    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mandatory: false,
            executable: true,
        }
    }

    fn library(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mandatory: false,
            executable: false,
        }
    }
}

/// The binaries copied for an environment
pub fn default_assets(config: &EnvironmentConfig) -> Vec<Asset> {
    let mut assets = vec![Asset::mandatory("/bin/sh")];
    assets.extend(OPTIONAL_BINARIES.iter().map(|p| Asset::optional(*p)));
    assets.push(Asset::optional(config.ssh.daemon.clone()));
    assets
}

/// True once a root holds both the daemon config and the init script
pub fn is_provisioned(root: &Path) -> bool {
    root.join(SSHD_CONFIG).is_file() && root.join(INIT_SCRIPT).is_file()
}

/// Extract library paths from `ldd` output
pub fn parse_ldd(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let candidate = match line.split_once("=>") {
                Some((_, rhs)) => rhs.split_whitespace().next()?,
                None => line.split_whitespace().next()?,
            };
            candidate.starts_with('/').then(|| PathBuf::from(candidate))
        })
        .collect()
}

/// Render the in-jail sshd configuration
pub fn render_sshd_config(config: &EnvironmentConfig) -> String {
    let ssh = &config.ssh;
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };

    let mut out = format!(
        "Port {}\n\
         ListenAddress {}\n\
         HostKey /etc/ssh/ssh_host_rsa_key\n\
         HostKey /etc/ssh/ssh_host_ecdsa_key\n\
         HostKey /etc/ssh/ssh_host_ed25519_key\n\
         PermitRootLogin {}\n\
         PasswordAuthentication {}\n\
         PubkeyAuthentication {}\n\
         MaxAuthTries {}\n\
         ClientAliveInterval {}\n\
         ClientAliveCountMax {}\n\
         X11Forwarding no\n\
         AllowTcpForwarding yes\n\
         PermitEmptyPasswords no\n\
         PrintMotd no\n\
         AcceptEnv LANG LC_*\n",
        ssh.port,
        ssh.listen_address,
        yes_no(ssh.permit_root_login),
        yes_no(ssh.password_auth),
        yes_no(ssh.pubkey_auth),
        ssh.max_auth_tries,
        ssh.client_alive_interval,
        ssh.client_alive_count_max,
    );

    if !config.users.is_empty() {
        let names: Vec<&str> = config.users.iter().map(|u| u.name.as_str()).collect();
        out.push_str(&format!("AllowUsers {}\n", names.join(" ")));
    }
    if ssh.banner.is_some() {
        out.push_str("Banner /etc/ssh/banner\n");
    }
    out
}

fn default_script(event: &str) -> String {
    format!(
        "#!/bin/sh\n# Jail {event} hook\necho \"Jail {event} at $(date)\" >> /var/log/jail.log\n"
    )
}

/// Populates a jail root for one environment
pub struct Provisioner<'a> {
    config: &'a EnvironmentConfig,
    root: &'a Path,
    sink: &'a dyn LogSink,
    assets: Vec<Asset>,
    discover_libraries: bool,
}

impl<'a> Provisioner<'a> {
    pub fn new(config: &'a EnvironmentConfig, root: &'a Path, sink: &'a dyn LogSink) -> Self {
        Self {
            config,
            root,
            sink,
            assets: default_assets(config),
            discover_libraries: true,
        }
    }

    /// Replace the asset list
    pub fn with_assets(mut self, assets: Vec<Asset>) -> Self {
        self.assets = assets;
        self
    }

    /// Skip shared-library copying entirely
    pub fn without_libraries(mut self) -> Self {
        self.discover_libraries = false;
        self
    }

    /// Run every provisioning step
    pub fn provision(&self) -> Result<()> {
        self.sink.info(LOG, &format!("Provisioning {}", self.root.display()));

        self.create_skeleton()?;
        let copied = self.copy_assets()?;
        if self.discover_libraries {
            self.copy_libraries(&copied)?;
        }
        self.create_devices();
        self.write_ssh_config()?;
        self.write_scripts()?;

        self.sink.info(LOG, &format!("Provisioned {}", self.root.display()));
        Ok(())
    }

    fn create_skeleton(&self) -> Result<()> {
        let homes = self.config.users.iter().map(|user| {
            Path::new(user.home.trim_start_matches('/')).join(&user.name)
        });
        let dirs = SKELETON.iter().map(PathBuf::from).chain(homes);

        for rel in dirs {
            let dir = self.root.join(rel);
            if !dir.exists() {
                self.sink.debug(LOG, &format!("Creating directory: {}", dir.display()));
                create_dir(&dir)?;
            }
        }

        let tmp = self.root.join("tmp");
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777)).map_err(|e| {
            Error::Provision {
                path: tmp.clone(),
                source: e,
            }
        })
    }

    /// Copy binaries; returns the host paths that were copied
    fn copy_assets(&self) -> Result<Vec<PathBuf>> {
        let mut copied = Vec::new();

        for asset in &self.assets {
            if !asset.path.exists() {
                if asset.mandatory {
                    self.sink.error(
                        LOG,
                        &format!("Required asset missing: {}", asset.path.display()),
                    );
                    return Err(Error::MissingAsset(asset.path.clone()));
                }
                self.sink.warning(
                    LOG,
                    &format!("Skipping missing asset: {}", asset.path.display()),
                );
                continue;
            }

            match self.copy_into_root(asset) {
                Ok(dest) => {
                    self.sink.debug(
                        LOG,
                        &format!("Copied {} -> {}", asset.path.display(), dest.display()),
                    );
                    copied.push(asset.path.clone());
                }
                Err(e) if asset.mandatory => return Err(e),
                Err(e) => self.sink.warning(LOG, &format!("Cannot copy asset: {}", e)),
            }
        }

        Ok(copied)
    }

    fn copy_libraries(&self, executables: &[PathBuf]) -> Result<()> {
        let mut libraries = BTreeSet::new();
        let mut discovered = false;

        for exe in executables {
            match Command::new("ldd").arg(exe).output() {
                Ok(output) if output.status.success() => {
                    discovered = true;
                    libraries.extend(parse_ldd(&String::from_utf8_lossy(&output.stdout)));
                }
                Ok(_) => {
                    // Static binaries make ldd exit non-zero
                    self.sink
                        .debug(LOG, &format!("No dynamic libraries for {}", exe.display()));
                }
                Err(e) => {
                    self.sink
                        .warning(LOG, &format!("ldd unavailable ({}), using fallback libraries", e));
                    break;
                }
            }
        }

        if !discovered {
            libraries.extend(FALLBACK_LIBRARIES.iter().map(PathBuf::from));
        }

        for lib in libraries {
            if !lib.exists() {
                self.sink
                    .warning(LOG, &format!("Skipping missing library: {}", lib.display()));
                continue;
            }
            if let Err(e) = self.copy_into_root(&Asset::library(&lib)) {
                self.sink.warning(LOG, &format!("Cannot copy library: {}", e));
            }
        }
        Ok(())
    }

    fn copy_into_root(&self, asset: &Asset) -> Result<PathBuf> {
        let rel = asset.path.strip_prefix("/").unwrap_or(&asset.path);
        let dest = self.root.join(rel);
        if let Some(parent) = dest.parent() {
            create_dir(parent)?;
        }

        fs::copy(&asset.path, &dest).map_err(|e| Error::Provision {
            path: dest.clone(),
            source: e,
        })?;

        if asset.executable {
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).map_err(|e| {
                Error::Provision {
                    path: dest.clone(),
                    source: e,
                }
            })?;
        }
        Ok(dest)
    }

    /// Create device nodes; failures (e.g. not root) are only warned about
    fn create_devices(&self) {
        for (name, major, minor) in DEVICES {
            let path = self.root.join("dev").join(name);
            if path.exists() {
                continue;
            }
            let mode = Mode::from_bits_truncate(0o666);
            if let Err(errno) = mknod(path.as_path(), SFlag::S_IFCHR, mode, makedev(*major, *minor)) {
                self.sink.warning(
                    LOG,
                    &format!("Cannot create device {}: {}", path.display(), errno),
                );
            }
        }
    }

    fn write_ssh_config(&self) -> Result<()> {
        self.sink.debug(LOG, "Generating SSH configuration");
        write_file(&self.root.join(SSHD_CONFIG), &render_sshd_config(self.config), 0o644)?;

        if let Some(banner) = &self.config.ssh.banner {
            let mut text = banner.clone();
            if !text.ends_with('\n') {
                text.push('\n');
            }
            write_file(&self.root.join(BANNER), &text, 0o644)?;
        }
        Ok(())
    }

    fn write_scripts(&self) -> Result<()> {
        let scripts = [
            (INIT_SCRIPT, self.config.init_script.as_deref(), "started"),
            (CLEANUP_SCRIPT, self.config.cleanup_script.as_deref(), "stopped"),
        ];

        for (rel, host, event) in scripts {
            let dest = self.root.join(rel);
            let body = match host {
                Some(host) => fs::read_to_string(host).map_err(|e| Error::Provision {
                    path: host.to_path_buf(),
                    source: e,
                })?,
                None => default_script(event),
            };
            write_file(&dest, &body, 0o755)?;
        }
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::Provision {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_file(path: &Path, content: &str, mode: u32) -> Result<()> {
    fs::write(path, content)
        .and_then(|_| fs::set_permissions(path, fs::Permissions::from_mode(mode)))
        .map_err(|e| Error::Provision {
            path: path.to_path_buf(),
            source: e,
        })
}
