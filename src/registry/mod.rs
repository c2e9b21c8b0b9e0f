//! Cross-process session registry
//!
//! One JSON record per recorded call lives in the registry directory. A
//! record names the process that owns the session, so another invocation can
//! refuse a conflicting start, clear a stale record left by a dead owner, or
//! ask the live owner to stop.
//!
//! Check-then-write sequences run under an advisory lock file (`fs2`). The
//! lock only serializes cooperating loqa-tracks processes.

mod process;
mod remote;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audio::OutputFormat;

pub use process::{ProcessProbe, SysinfoProbe};
pub use remote::{request_stop, StopOutcome, StopTimeouts};

const LOCK_FILE: &str = "registry.lock";

/// Persisted identity of a running session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub session_id: String,
    pub call_id: String,
    pub channel_id: String,
    /// Session directory; the stop marker is written here
    pub output_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub owner_pid: u32,
    pub format: OutputFormat,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("call {call_id} is owned by live process {owner_pid}")]
    Conflict { call_id: String, owner_pid: u32 },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Reduce an identifier to characters safe in a file name
pub fn safe_component(value: &str) -> String {
    let safe: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match safe.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Exclusive hold on the registry lock file, released on drop
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open registry lock {}", path.display()))?;

        FileExt::lock_exclusive(&file).with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
}

impl SessionRegistry {
    /// Open (creating if needed) a registry directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create registry dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// `<data dir>/loqa-tracks/registry`, or under the temp dir without one
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("loqa-tracks")
            .join("registry")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, call_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_component(call_id)))
    }

    fn lock(&self) -> Result<RegistryLock> {
        RegistryLock::acquire(&self.dir.join(LOCK_FILE))
    }

    fn read(&self, call_id: &str) -> Result<Option<RegistryRecord>> {
        let path = self.record_path(call_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        match serde_json::from_str(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Unreadable records cannot name a live owner
                warn!("Ignoring corrupt registry record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn write(&self, record: &RegistryRecord) -> Result<()> {
        let path = self.record_path(&record.call_id);
        let tmp = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(record).context("Failed to serialize registry record")?;

        fs::write(&tmp, encoded).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    fn remove(&self, call_id: &str) -> Result<bool> {
        let path = self.record_path(call_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Current record for a call, if any
    pub fn load(&self, call_id: &str) -> Result<Option<RegistryRecord>> {
        let _lock = self.lock()?;
        self.read(call_id)
    }

    /// Register `record` as the owner of its call
    ///
    /// Fails with `Conflict` while a live process owns the call. A record
    /// left behind by a dead owner is replaced and returned.
    pub fn claim(
        &self,
        record: &RegistryRecord,
        probe: &dyn ProcessProbe,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let _lock = self.lock()?;

        let stale = match self.read(&record.call_id)? {
            Some(existing) if probe.is_owner(&existing) => {
                return Err(RegistryError::Conflict {
                    call_id: existing.call_id,
                    owner_pid: existing.owner_pid,
                });
            }
            Some(existing) => {
                info!(
                    "Clearing stale registry record for call {} (pid {} is gone)",
                    existing.call_id, existing.owner_pid
                );
                Some(existing)
            }
            None => None,
        };

        self.write(record)?;
        debug!("Registered call {} for pid {}", record.call_id, record.owner_pid);
        Ok(stale)
    }

    /// Remove the record for `call_id` if `owner_pid` still owns it
    pub fn release(&self, call_id: &str, owner_pid: u32) -> Result<bool> {
        let _lock = self.lock()?;

        match self.read(call_id)? {
            Some(existing) if existing.owner_pid == owner_pid => self.remove(call_id),
            Some(existing) => {
                warn!(
                    "Not releasing call {}: owned by pid {}, not {}",
                    call_id, existing.owner_pid, owner_pid
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Remove the record for `call_id` regardless of owner
    pub fn clear(&self, call_id: &str) -> Result<bool> {
        let _lock = self.lock()?;
        self.remove(call_id)
    }

    /// All readable records, oldest first
    pub fn list(&self) -> Result<Vec<RegistryRecord>> {
        let _lock = self.lock()?;

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("Failed to list {}", self.dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str::<RegistryRecord>(&s).map_err(anyhow::Error::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping registry record {}: {}", path.display(), e),
            }
        }

        records.sort_by_key(|r| r.start_time);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_component() {
        assert_eq!(safe_component("guild-1/voice 2"), "guild-1_voice_2");
        assert_eq!(safe_component("../.."), "_");
        assert_eq!(safe_component("..hidden"), "hidden");
        assert_eq!(safe_component(""), "_");
    }

    #[test]
    fn test_records_are_keyed_by_safe_call_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.record_path("a/b"), dir.path().join("a_b.json"));
    }

    #[test]
    fn test_corrupt_record_reads_as_absent() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::open(dir.path()).unwrap();
        fs::write(dir.path().join("call.json"), "{not json").unwrap();

        assert!(registry.load("call").unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());
    }
}
