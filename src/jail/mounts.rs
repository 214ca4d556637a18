//! Mount management for jail roots
//!
//! Every mount is scoped under a jail root. Established mounts are kept in
//! order and torn down strictly in reverse, retrying targets that report
//! EBUSY with an exponential backoff.

use crate::error::{Error, Result};
use crate::jail::types::MountRecord;
use crate::logging::LogSink;
use crate::manifest::{JailSettings, MountSpec};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use rand::rng;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LOG: &str = "mount";

/// OS seam for mount syscalls
pub trait Mounter: Send + Sync {
    /// Establish one mount
    fn mount(&self, record: &MountRecord) -> std::result::Result<(), Errno>;

    /// Detach the mount at `target`
    fn unmount(&self, target: &Path) -> std::result::Result<(), Errno>;

    /// Mount points currently visible to this process
    fn mount_table(&self) -> io::Result<Vec<PathBuf>>;
}

/// Mounter backed by mount(2)/umount2(2)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, record: &MountRecord) -> std::result::Result<(), Errno> {
        let (flags, data) = record.flags_and_data();
        let bind = flags.contains(MsFlags::MS_BIND);

        // Bind mounts ignore MS_RDONLY on the first call
        let first = if bind {
            flags & !MsFlags::MS_RDONLY
        } else {
            flags
        };
        mount(
            Some(record.source.as_str()),
            record.target.as_path(),
            Some(record.fstype.as_str()),
            first,
            data.as_deref(),
        )?;

        if bind && flags.contains(MsFlags::MS_RDONLY) {
            mount(
                None::<&str>,
                record.target.as_path(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), Errno> {
        umount2(target, MntFlags::UMOUNT_NOFOLLOW)
    }

    fn mount_table(&self) -> io::Result<Vec<PathBuf>> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        Ok(parse_mountinfo(&content))
    }
}

/// Extract mount points from /proc/self/mountinfo content
///
/// Format: mount_id parent_id major:minor root mount_point options ... - fstype source super_options
pub fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 || !parts.contains(&"-") {
                return None;
            }
            Some(PathBuf::from(unescape_mountinfo(parts[4])))
        })
        .collect()
}

/// Decode the octal escapes (`\040` for space, ...) the kernel uses in mountinfo
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let code = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(code) = u8::try_from(code) {
                    out.push(code);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Retry policy for busy unmounts
#[derive(Debug, Clone)]
pub struct UnmountPolicy {
    /// Total attempts per target, including the first
    pub attempts: u8,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl UnmountPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        let base = self.base_delay.as_millis() as u64;
        ExponentialBackoff::new()
            .base_delay_ms(base)
            .max_delay_ms(base.saturating_mul(10).max(base))
            .multiplier(self.multiplier)
            .max_attempts(self.attempts.max(1))
            .jitter_factor(0.0)
    }
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 1.0,
        }
    }
}

impl From<&JailSettings> for UnmountPolicy {
    fn from(settings: &JailSettings) -> Self {
        Self {
            attempts: settings.unmount_attempts.max(1),
            base_delay: settings.unmount_delay,
            multiplier: settings.unmount_multiplier,
        }
    }
}

/// Outcome of a teardown pass
#[derive(Debug, Default, Clone)]
pub struct UnmountReport {
    /// Targets detached, in the order they were detached
    pub unmounted: Vec<PathBuf>,
    /// Targets given up on, with the last error seen
    pub abandoned: Vec<(PathBuf, Errno)>,
}

impl UnmountReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }

    /// Human-readable summary of abandoned mounts
    pub fn describe_abandoned(&self) -> Option<String> {
        if self.abandoned.is_empty() {
            return None;
        }
        let targets: Vec<String> = self
            .abandoned
            .iter()
            .map(|(target, errno)| format!("{} ({})", target.display(), errno))
            .collect();
        Some(format!("failed to unmount {}", targets.join(", ")))
    }
}

/// The fixed pseudo-filesystem mounts every jail gets, in establishment order
pub fn fixed_mounts(root: &Path) -> Vec<MountRecord> {
    vec![
        MountRecord::new("proc", root.join("proc"), "proc", ""),
        MountRecord::new("sysfs", root.join("sys"), "sysfs", ""),
        MountRecord::new("devpts", root.join("dev/pts"), "devpts", "gid=5,mode=620"),
        MountRecord::new("/tmp", root.join("tmp"), "none", "bind"),
    ]
}

/// Resolve a configured mount under the jail root
pub fn configured_mount(root: &Path, spec: &MountSpec) -> Result<MountRecord> {
    let relative: PathBuf = Path::new(&spec.target)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(Ok(part)),
            Component::ParentDir => Some(Err(())),
            _ => None,
        })
        .collect::<std::result::Result<PathBuf, ()>>()
        .map_err(|_| {
            Error::ConfigValidation(format!(
                "mount target '{}' contains invalid directory traversal",
                spec.target
            ))
        })?;

    if relative.as_os_str().is_empty() {
        return Err(Error::ConfigValidation(format!(
            "mount target '{}' resolves to the jail root",
            spec.target
        )));
    }

    let (fstype, mut options) = match &spec.fstype {
        Some(fstype) => (fstype.clone(), Vec::new()),
        None => ("none".to_string(), vec!["bind"]),
    };
    if spec.read_only {
        options.push("ro");
    }

    Ok(MountRecord::new(
        spec.source.clone(),
        root.join(relative),
        fstype,
        options.join(","),
    ))
}

/// Create `target` under `root`, refusing symlinked components
///
/// The jail tree is writable from inside the jail, so any directory on the
/// way to a mount point may have been swapped for a link to a host path.
fn prepare_target(root: &Path, target: &Path) -> Result<()> {
    let escape = || Error::MountEscape {
        target: target.to_path_buf(),
        root: root.to_path_buf(),
    };
    let relative = target.strip_prefix(root).map_err(|_| escape())?;

    let mut current = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => current.push(part),
            _ => return Err(escape()),
        }
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Err(escape()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => {
                return Err(Error::Provision {
                    path: current,
                    source: e,
                });
            }
        }
    }

    fs::create_dir_all(target).map_err(|e| Error::Provision {
        path: target.to_path_buf(),
        source: e,
    })?;

    let canonical = |path: &Path| {
        path.canonicalize().map_err(|e| Error::Provision {
            path: path.to_path_buf(),
            source: e,
        })
    };
    if !canonical(target)?.starts_with(canonical(root)?) {
        return Err(escape());
    }
    Ok(())
}

/// Establishes and tears down a jail's mounts
pub struct MountCoordinator {
    mounter: Arc<dyn Mounter>,
    policy: UnmountPolicy,
    sink: Arc<dyn LogSink>,
    active: Vec<MountRecord>,
}

impl MountCoordinator {
    pub fn new(mounter: Arc<dyn Mounter>, policy: UnmountPolicy, sink: Arc<dyn LogSink>) -> Self {
        Self {
            mounter,
            policy,
            sink,
            active: Vec::new(),
        }
    }

    /// Mounts currently held, in establishment order
    pub fn active(&self) -> &[MountRecord] {
        &self.active
    }

    /// Take ownership of mounts established by an earlier process
    pub fn adopt(&mut self, records: Vec<MountRecord>) {
        self.active = records;
    }

    /// Establish `records` in order
    ///
    /// Every target must stay under `root` without passing through a symlink.
    /// Stops at the first failure. Mounts that succeeded before it stay in the
    /// active list for a later [`unmount_all`](Self::unmount_all).
    pub fn mount_all(&mut self, root: &Path, records: Vec<MountRecord>) -> Result<()> {
        for record in records {
            if let Err(e) = prepare_target(root, &record.target) {
                self.sink.error(LOG, &format!("Refusing to mount {}: {}", record, e));
                return Err(e);
            }

            if let Err(errno) = self.mounter.mount(&record) {
                self.sink.error(LOG, &format!("Failed to mount {}: {}", record, errno));
                return Err(Error::MountFailed {
                    target: record.target,
                    fstype: record.fstype,
                    errno,
                });
            }

            self.sink.debug(LOG, &format!("Mounted {}", record));
            self.active.push(record);
        }
        Ok(())
    }

    /// Detach every active mount, newest first
    ///
    /// Never fails as a whole: targets that cannot be detached are logged and
    /// reported. The active list is empty afterwards.
    pub fn unmount_all(&mut self) -> UnmountReport {
        let mut report = UnmountReport::default();

        while let Some(record) = self.active.pop() {
            match self.unmount_with_retry(&record.target) {
                Ok(()) => {
                    self.sink.debug(LOG, &format!("Unmounted {}", record.target.display()));
                    report.unmounted.push(record.target);
                }
                Err(errno) => {
                    self.sink.error(
                        LOG,
                        &format!("Giving up on {}: {}", record.target.display(), errno),
                    );
                    report.abandoned.push((record.target, errno));
                }
            }
        }

        report
    }

    /// Detach anything still mounted under `root`, deepest first
    ///
    /// Returns the mount points that survived.
    pub fn sweep(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut leftovers = self.mounts_under(&root)?;
        if leftovers.is_empty() {
            return Ok(leftovers);
        }

        leftovers.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        self.sink.warning(
            LOG,
            &format!("Found {} leftover mount(s) under {}", leftovers.len(), root.display()),
        );

        for target in &leftovers {
            if let Err(errno) = self.unmount_with_retry(target) {
                self.sink
                    .error(LOG, &format!("Failed to sweep {}: {}", target.display(), errno));
            }
        }

        self.mounts_under(&root)
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let table = self.mounter.mount_table()?;
        Ok(table.into_iter().filter(|p| p.starts_with(root)).collect())
    }

    /// Unmount one target, retrying only on EBUSY
    fn unmount_with_retry(&self, target: &Path) -> std::result::Result<(), Errno> {
        let backoff = self.policy.backoff();
        let mut rng = rng();
        let mut attempt: u8 = 0;

        loop {
            attempt += 1;
            match self.mounter.unmount(target) {
                Ok(()) => return Ok(()),
                Err(Errno::EBUSY) if attempt < self.policy.attempts => {
                    let delay_ms = backoff
                        .delay(attempt, &mut rng)
                        .unwrap_or(self.policy.base_delay.as_millis() as u64);
                    self.sink.warning(
                        LOG,
                        &format!(
                            "{} is busy (attempt {}), retrying in {}ms",
                            target.display(),
                            attempt,
                            delay_ms
                        ),
                    );
                    thread::sleep(Duration::from_millis(delay_ms));
                }
                Err(errno) => return Err(errno),
            }
        }
    }
}
