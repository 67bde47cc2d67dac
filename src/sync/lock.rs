//! Per-message exclusivity markers.
//!
//! A lock is a file named `<code>.lock` (or `<scope>-<code>.lock` for a
//! scoped manager) created with create-exclusive semantics in a directory
//! shared by every cooperating process. Sync tasks scope their locks to
//! their watermark key, so only runs of the same task exclude each other.
//! Failure to create the file means another process owns the message right
//! now; callers skip the message and move on. There is no waiting, no re-entrancy and no
//! ownership transfer.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    scope: Option<String>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scope: None,
        }
    }

    /// Same directory, markers private to `key`.
    pub fn scoped(&self, key: &str) -> Self {
        Self {
            dir: self.dir.clone(),
            scope: Some(super::key_file_stem(key)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, code: u64) -> PathBuf {
        match &self.scope {
            Some(scope) => self.dir.join(format!("{scope}-{code}.lock")),
            None => self.dir.join(format!("{code}.lock")),
        }
    }

    fn lock_error(path: PathBuf, source: io::Error) -> SyncError {
        SyncError::Lock { path, source }
    }

    /// Try to take the lock for `code`. `Ok(None)` means it is held
    /// elsewhere.
    pub fn try_lock(&self, code: u64) -> Result<Option<LockGuard>, SyncError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::lock_error(self.dir.clone(), e))?;
        let path = self.path_for(code);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(code, "Lock held elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(Self::lock_error(path, e)),
        };

        // Diagnostics only; the marker's existence is the lock.
        let _ = writeln!(
            file,
            "pid={} acquired={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );

        Ok(Some(LockGuard {
            manager: self.clone(),
            code,
            released: false,
        }))
    }

    /// Remove the marker for `code`. A missing marker is not an error.
    pub fn release_lock(&self, code: u64) -> Result<(), SyncError> {
        let path = self.path_for(code);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::lock_error(path, e)),
        }
    }

    /// Remove markers older than `max_age`, left behind by processes that
    /// died while holding them. Covers every scope in the directory.
    /// Operator-invoked only.
    pub fn clear_stale(&self, max_age: Duration) -> Result<usize, SyncError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Self::lock_error(self.dir.clone(), e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Self::lock_error(self.dir.clone(), e))?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "lock") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(|e| Self::lock_error(path.clone(), e))?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), age_secs = age.as_secs(), "Removed stale lock");
                        removed += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Self::lock_error(path, e)),
                }
            }
        }
        Ok(removed)
    }
}

/// Held lock. Released by [`LockGuard::release`] or on drop.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    code: u64,
    released: bool,
}

impl LockGuard {
    pub fn code(&self) -> u64 {
        self.code
    }

    pub fn release(mut self) -> Result<(), SyncError> {
        self.released = true;
        self.manager.release_lock(self.code)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.manager.release_lock(self.code) {
                warn!(code = self.code, "Failed to release lock: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_is_refused() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path());

        let guard = locks.try_lock(7).unwrap().expect("first lock");
        assert!(locks.try_lock(7).unwrap().is_none());
        assert!(locks.try_lock(8).unwrap().is_some());

        guard.release().unwrap();
        assert!(locks.try_lock(7).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path());
        {
            let _guard = locks.try_lock(3).unwrap().unwrap();
            assert!(dir.path().join("3.lock").exists());
        }
        assert!(!dir.path().join("3.lock").exists());
    }

    #[test]
    fn test_exactly_one_concurrent_winner() {
        let dir = TempDir::new().unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = LockManager::new(dir.path());
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    // Keep the guard alive so losers cannot re-acquire.
                    locks.try_lock(42).unwrap().map(std::mem::forget).is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_clear_stale() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path());
        std::mem::forget(locks.try_lock(1).unwrap().unwrap());
        std::mem::forget(locks.try_lock(2).unwrap().unwrap());

        assert_eq!(locks.clear_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(locks.clear_stale(Duration::ZERO).unwrap(), 2);
        assert!(locks.try_lock(1).unwrap().is_some());
    }

    #[test]
    fn test_scopes_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let base = LockManager::new(dir.path());
        let a = base.scoped("https://mo/ws#a");
        let b = base.scoped("https://mo/ws#b");

        let held = a.try_lock(7).unwrap().expect("scope a");
        assert!(dir.path().join("https___mo_ws_a-7.lock").exists());
        assert!(b.try_lock(7).unwrap().is_some());
        assert!(base.scoped("https://mo/ws#a").try_lock(7).unwrap().is_none());

        std::mem::forget(held);
        assert_eq!(base.clear_stale(Duration::ZERO).unwrap(), 1);
        assert!(a.try_lock(7).unwrap().is_some());
    }

    #[test]
    fn test_release_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(LockManager::new(dir.path()).release_lock(99).is_ok());
    }
}
