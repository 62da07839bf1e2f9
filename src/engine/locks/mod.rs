//! Run Lock
//!
//! Only one update run may touch a cache directory at a time. The lock is a
//! JSON file recording who holds it; a lock left behind by a dead process
//! is reclaimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const LOCK_FILE_NAME: &str = "update.lock";

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
}

impl LockInfo {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            description: "Update run in progress".to_string(),
        }
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    /// Same process and start time
    pub fn same_holder(&self, other: &LockInfo) -> bool {
        self.pid == other.pid && self.started_at == other.started_at
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }
}

impl Default for LockInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("{path} held by PID {pid} since {started_at}")]
    AlreadyLocked {
        path: PathBuf,
        pid: u32,
        started_at: DateTime<Utc>,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lock over one cache directory
pub struct RunLock {
    lock_path: PathBuf,
}

impl RunLock {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            lock_path: cache_dir.join(LOCK_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquire the lock, reclaiming it if the holder is gone
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let info = LockInfo::new();
        let content = serde_json::to_string_pretty(&info)?;

        // Two attempts: the second follows removal of a stale lock
        for _ in 0..2 {
            match self.publish(&content) {
                Ok(()) => {
                    return Ok(LockGuard {
                        lock_path: self.lock_path.clone(),
                        holder: info,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let existing = self.read_lock();
                    if let Some(holder) = existing.as_ref().filter(|h| h.is_process_alive()) {
                        return Err(self.locked_by(holder));
                    }
                    warn!(
                        "Reclaiming stale lock {} (pid {:?})",
                        self.lock_path.display(),
                        existing.as_ref().map(|i| i.pid)
                    );
                    self.reclaim(existing.as_ref())?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let holder = self.read_lock().unwrap_or_default();
        Err(self.locked_by(&holder))
    }

    /// Current holder, if the lock file exists and parses
    pub fn read_lock(&self) -> Option<LockInfo> {
        read_info(&self.lock_path)
    }

    fn locked_by(&self, holder: &LockInfo) -> LockError {
        LockError::AlreadyLocked {
            path: self.lock_path.clone(),
            pid: holder.pid,
            started_at: holder.started_at,
        }
    }

    /// Write the full record to a private file, then link it into place.
    /// The link fails if a lock exists, and readers never see a partial file.
    fn publish(&self, content: &str) -> io::Result<()> {
        let staging = self.side_path("new");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        let linked = fs::hard_link(&staging, &self.lock_path);
        let _ = fs::remove_file(&staging);
        linked
    }

    /// Move a stale lock out of the way.
    ///
    /// The rename is atomic, so only one reclaimer gets the file. If what was
    /// moved is not the lock judged stale, another run took the lock in the
    /// meantime: it is linked back and the caller sees `AlreadyLocked`.
    fn reclaim(&self, seen: Option<&LockInfo>) -> Result<(), LockError> {
        let aside = self.side_path("stale");
        match fs::rename(&self.lock_path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let moved = read_info(&aside);
        let same = match (seen, moved.as_ref()) {
            (Some(seen), Some(moved)) => seen.same_holder(moved),
            (None, None) => true,
            _ => false,
        };
        if same {
            fs::remove_file(&aside)?;
            return Ok(());
        }

        let restored = fs::hard_link(&aside, &self.lock_path);
        let _ = fs::remove_file(&aside);
        if let Err(e) = restored {
            warn!("Could not restore {}: {}", self.lock_path.display(), e);
        }
        let holder = moved.or_else(|| self.read_lock()).unwrap_or_default();
        Err(self.locked_by(&holder))
    }

    fn side_path(&self, kind: &str) -> PathBuf {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        self.lock_path
            .with_extension(format!("lock.{}.{}.{}", kind, std::process::id(), nanos))
    }
}

fn read_info(path: &Path) -> Option<LockInfo> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// RAII guard that releases lock on drop
pub struct LockGuard {
    lock_path: PathBuf,
    holder: LockInfo,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the file while it still names this holder
        if read_info(&self.lock_path).is_some_and(|current| current.same_holder(&self.holder)) {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_release() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path());

        let guard = lock.acquire().unwrap();
        assert!(lock.path().exists());
        assert_eq!(lock.read_lock().unwrap().pid, std::process::id());

        // Can't acquire same lock twice
        assert!(matches!(lock.acquire(), Err(LockError::AlreadyLocked { .. })));

        drop(guard);
        assert!(!lock.path().exists());

        // Can acquire after release
        assert!(lock.acquire().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path());

        let mut stale = LockInfo::new().with_description("crashed run");
        stale.pid = u32::MAX - 1;
        fs::write(lock.path(), serde_json::to_string(&stale).unwrap()).unwrap();

        let _guard = lock.acquire().unwrap();
        assert_eq!(lock.read_lock().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_unreadable_lock_reclaimed() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path());
        fs::write(lock.path(), "garbage").unwrap();
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_reclaim_hands_back_a_lock_taken_meanwhile() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path());

        // The file judged stale was replaced by a live run before the reclaim
        let mut stale = LockInfo::new();
        stale.pid = u32::MAX - 1;
        let live = lock.acquire().unwrap();

        assert!(matches!(
            lock.reclaim(Some(&stale)),
            Err(LockError::AlreadyLocked { pid, .. }) if pid == std::process::id()
        ));
        assert_eq!(lock.read_lock().unwrap().pid, std::process::id());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        drop(live);
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_guard_leaves_a_lock_it_no_longer_owns() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path());
        let guard = lock.acquire().unwrap();

        let mut other = LockInfo::new().with_description("another run");
        other.pid = u32::MAX - 2;
        fs::write(lock.path(), serde_json::to_string(&other).unwrap()).unwrap();
        drop(guard);
        assert!(lock.path().exists());
    }
}
