use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use coldchain_types::error::{ColdchainError, Result};

pub const LOCK_FILE: &str = "lock.json";
const DEFAULT_STALE_LOCK_SECS: i64 = 6 * 60 * 60;

/// Contents of `<state_dir>/lock.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub hostname: String,
    pub pid: u32,
    pub time: DateTime<Utc>,
}

/// Held state-directory lock; released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    released: bool,
}

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_lock_file(&self.path)
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_lock_file(&self.path) {
                warn!(path = %self.path.display(), "failed to release state lock: {e}");
            }
        }
    }
}

/// Acquire the advisory lock guarding `state_dir` against overlapping runs.
///
/// A lock older than six hours is assumed to belong to a killed process and
/// is replaced.
pub fn acquire_lock(state_dir: &Path) -> Result<StateLock> {
    acquire_lock_with_stale_age(state_dir, Duration::seconds(DEFAULT_STALE_LOCK_SECS))
}

pub fn acquire_lock_with_stale_age(state_dir: &Path, stale_after: Duration) -> Result<StateLock> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join(LOCK_FILE);
    let entry = LockEntry {
        hostname: crate::platform::hostname(),
        pid: std::process::id(),
        time: Utc::now(),
    };
    let data = serde_json::to_vec_pretty(&entry)?;

    for _ in 0..2 {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(&data)?;
                file.sync_all()?;
                debug!(path = %path.display(), "state lock acquired");
                return Ok(StateLock {
                    path,
                    released: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_lock(&path);
                match holder {
                    Some(h) if Utc::now().signed_duration_since(h.time) > stale_after => {
                        warn!(
                            hostname = %h.hostname,
                            pid = h.pid,
                            since = %h.time,
                            "removing stale state lock"
                        );
                        remove_lock_file(&path)?;
                    }
                    Some(h) => {
                        return Err(ColdchainError::Locked(format!(
                            "{} (held by {} pid {} since {})",
                            path.display(),
                            h.hostname,
                            h.pid,
                            h.time.to_rfc3339()
                        )))
                    }
                    None => {
                        return Err(ColdchainError::Locked(format!(
                            "{} (unreadable; run `coldchain break-lock` if no other run is active)",
                            path.display()
                        )))
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ColdchainError::Locked(path.display().to_string()))
}

/// Forcibly remove the lock file. Returns whether one existed.
pub fn break_lock(state_dir: &Path) -> Result<bool> {
    let path = state_dir.join(LOCK_FILE);
    if !path.exists() {
        return Ok(false);
    }
    remove_lock_file(&path)?;
    Ok(true)
}

/// Who holds the lock right now, if anyone.
pub fn current_holder(state_dir: &Path) -> Option<LockEntry> {
    read_lock(&state_dir.join(LOCK_FILE))
}

fn read_lock(path: &Path) -> Option<LockEntry> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
