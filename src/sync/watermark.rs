// Persisted sync watermarks
//
// One small text file per endpoint key, rewritten atomically (temp file +
// rename). Read-modify-persist is serialized per key: an in-process mutex
// for tasks sharing the store, and an fs2 exclusive lock on a sidecar file
// for processes sharing the directory.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::SyncError;

/// Persistence collaborator for the highest code processed per endpoint.
pub trait WatermarkStore: Send + Sync {
    /// Last persisted code, `0` when nothing was stored yet.
    fn load(&self, key: &str) -> Result<u64, SyncError>;

    /// Persist `max(current, code)` and return the stored value. Never
    /// decreases the watermark.
    fn advance(&self, key: &str, code: u64) -> Result<u64, SyncError>;
}

pub struct FileWatermarkStore {
    dir: PathBuf,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileWatermarkStore {
    const FORMAT_VERSION: &'static str = "v1";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// State file for a key. Unsafe characters become `_`; the key itself
    /// is stored in the file header and checked on load.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.wm", super::key_file_stem(key)))
    }

    fn guard(&self, key: &str) -> Arc<Mutex<()>> {
        let mut guards = match self.guards.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(guards.entry(key.to_string()).or_default())
    }

    fn read(&self, key: &str, path: &Path) -> io::Result<u64> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut code = None;
        for line in content.lines() {
            let line = line.trim();
            if let Some(stored) = line.strip_prefix("# key: ") {
                if stored != key {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("state file belongs to key {stored:?}"),
                    ));
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            code = Some(line.parse::<u64>().map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("invalid watermark {line:?}: {e}"))
            })?);
        }
        Ok(code.unwrap_or(0))
    }

    fn write(&self, key: &str, path: &Path, code: u64) -> io::Result<()> {
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        writeln!(temp, "# mexsync watermark {}", Self::FORMAT_VERSION)?;
        writeln!(temp, "# key: {key}")?;
        writeln!(temp, "# updated: {}", chrono::Utc::now().to_rfc3339())?;
        writeln!(temp, "{code}")?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn advance_locked(&self, key: &str, code: u64) -> io::Result<u64> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);

        let lock_path = path.with_extension("wm.lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.lock_exclusive()?;

        let result = (|| -> io::Result<u64> {
            let current = self.read(key, &path)?;
            if code <= current {
                return Ok(current);
            }
            self.write(key, &path, code)?;
            debug!(key, from = current, to = code, "Watermark advanced");
            Ok(code)
        })();

        // Closing the handle releases the lock as well.
        let _ = FileExt::unlock(&lock);
        result
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn load(&self, key: &str) -> Result<u64, SyncError> {
        self.read(key, &self.path_for(key))
            .map_err(|source| SyncError::Watermark {
                key: key.to_string(),
                source,
            })
    }

    fn advance(&self, key: &str, code: u64) -> Result<u64, SyncError> {
        let guard = self.guard(key);
        let _held = match guard.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.advance_locked(key, code)
            .map_err(|source| SyncError::Watermark {
                key: key.to_string(),
                source,
            })
    }
}
