//! Runtime state files
//!
//! Each CLI invocation is a fresh process, so a running jail's service pid
//! and mounts are written to `<state_dir>/<name>.json` and read back when
//! the jail is registered again.

use crate::error::{Error, Result};
use crate::jail::types::MountRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// What survives between invocations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub pid: Option<i32>,
    pub started_at: Option<SystemTime>,
    #[serde(default)]
    pub mounts: Vec<MountRecord>,
}

impl RuntimeRecord {
    /// True if nothing is held by the jail
    pub fn is_idle(&self) -> bool {
        self.pid.is_none() && self.mounts.is_empty()
    }
}

/// Reads and writes one jail's state file
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{}.json", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record; a missing file means no state
    pub fn load(&self) -> Result<Option<RuntimeRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::StateFile {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write the record, or remove the file when the jail holds nothing
    pub fn save(&self, record: &RuntimeRecord) -> Result<()> {
        if record.is_idle() {
            return self.clear();
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StateFile {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| Error::StateFile {
                path: self.path.clone(),
                source: e,
            })
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StateFile {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}
