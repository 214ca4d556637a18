//! POSIX resource limits for jailed processes
//!
//! Limits are converted into a plan once, then applied inside each forked
//! child before it execs, so the managing process never inherits them.

use crate::manifest::ResourceLimits;
use nix::sys::resource::{Resource, setrlimit};
use std::fmt;

/// One rlimit to set, soft and hard alike
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: Resource,
    pub value: u64,
}

impl Rlimit {
    fn name(&self) -> &'static str {
        match self.resource {
            Resource::RLIMIT_CPU => "cpu",
            Resource::RLIMIT_AS => "address-space",
            Resource::RLIMIT_FSIZE => "file-size",
            Resource::RLIMIT_NPROC => "processes",
            Resource::RLIMIT_NOFILE => "open-files",
            _ => "other",
        }
    }
}

/// Converts configured ceilings into setrlimit calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimiter {
    plan: Vec<Rlimit>,
}

impl ResourceLimiter {
    /// Build the plan; zero values leave that limit untouched
    pub fn new(limits: &ResourceLimits) -> Self {
        let candidates = [
            (Resource::RLIMIT_CPU, limits.max_cpu_time),
            (Resource::RLIMIT_AS, limits.max_memory.saturating_mul(1024)),
            (Resource::RLIMIT_FSIZE, limits.max_file_size.saturating_mul(1024)),
            (Resource::RLIMIT_NPROC, limits.max_processes),
            (Resource::RLIMIT_NOFILE, limits.max_open_files),
        ];

        let plan = candidates
            .into_iter()
            .filter(|(_, value)| *value > 0)
            .map(|(resource, value)| Rlimit { resource, value })
            .collect();

        Self { plan }
    }

    pub fn plan(&self) -> &[Rlimit] {
        &self.plan
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    /// Apply every limit to the calling process
    ///
    /// Best-effort: a limit the kernel refuses is skipped. Does not allocate,
    /// so it is safe to call between fork and exec.
    pub fn apply(&self) -> usize {
        self.plan
            .iter()
            .filter(|limit| setrlimit(limit.resource, limit.value, limit.value).is_err())
            .count()
    }
}

impl fmt::Display for ResourceLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.plan.is_empty() {
            return f.write_str("no limits");
        }
        for (i, limit) in self.plan.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", limit.name(), limit.value)?;
        }
        Ok(())
    }
}
