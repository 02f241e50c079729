//! On-disk persistence for TTL cache entries
//!
//! Each cache type owns one JSON file mapping cache key to entry. A companion
//! `.lock` file next to it is held with `flock` for the duration of every
//! read-modify-write cycle, so several processes can share the file. Writes
//! go to a temporary file in the same directory which is then renamed over
//! the data file.

use crate::error::{ResolveError, Result};
use crate::ttl_cache::{now_ms, CacheEntry};
use nix::fcntl::{flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Pending change for one key: `Some` replaces the entry, `None` removes it
pub type PendingWrites<V> = HashMap<String, Option<CacheEntry<V>>>;

/// Held `flock` on the companion lock file; released when dropped
struct FileLock {
    _file: File,
}

/// JSON file backing one cache
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    /// Create a store for `path`; the lock file uses the same base name
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock_path = path.with_extension("lock");
        JsonFileStore { path, lock_path }
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the companion lock file
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Load every entry currently on disk
    ///
    /// A missing file is an empty store.
    pub fn load<V: DeserializeOwned>(&self) -> Result<HashMap<String, CacheEntry<V>>> {
        let _lock = self.lock(false)?;
        self.read_map()
    }

    /// Apply pending puts and removals
    ///
    /// Entries equal to what is already on disk are skipped, and the file is
    /// only rewritten when something actually changed. Returns the number of
    /// keys that changed.
    pub fn apply<V>(&self, pending: PendingWrites<V>) -> Result<usize>
    where
        V: Serialize + DeserializeOwned + PartialEq,
    {
        let _lock = self.lock(true)?;
        let mut map = self.read_map_or_reset::<V>();

        let mut changed = 0;
        for (key, update) in pending {
            match update {
                Some(entry) => {
                    if map.get(&key) != Some(&entry) {
                        map.insert(key, entry);
                        changed += 1;
                    }
                }
                None => {
                    if map.remove(&key).is_some() {
                        changed += 1;
                    }
                }
            }
        }

        if changed > 0 {
            self.write_map(&map)?;
            debug!("Persisted {} changed entries to {}", changed, self.path.display());
        }
        Ok(changed)
    }

    /// Rewrite the file without expired entries; returns how many were dropped
    pub fn compact<V>(&self) -> Result<usize>
    where
        V: Serialize + DeserializeOwned,
    {
        let _lock = self.lock(true)?;
        let mut map = self.read_map_or_reset::<V>();
        let now = now_ms();
        let before = map.len();
        map.retain(|_, entry| entry.is_valid_at(now));
        let removed = before - map.len();

        if removed > 0 {
            self.write_map(&map)?;
            debug!("Compacted {}: dropped {} expired entries", self.path.display(), removed);
        }
        Ok(removed)
    }

    fn lock(&self, exclusive: bool) -> Result<FileLock> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ResolveError::Persistence(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                ResolveError::Persistence(format!(
                    "Failed to open lock file {}: {}",
                    self.lock_path.display(),
                    e
                ))
            })?;

        let arg = if exclusive {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockShared
        };
        flock(file.as_raw_fd(), arg).map_err(|e| {
            ResolveError::Persistence(format!(
                "Failed to lock {}: {}",
                self.lock_path.display(),
                e
            ))
        })?;

        Ok(FileLock { _file: file })
    }

    fn read_map<V: DeserializeOwned>(&self) -> Result<HashMap<String, CacheEntry<V>>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(ResolveError::Persistence(format!(
                    "Failed to open {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if file.metadata().map(|m| m.len() == 0).unwrap_or(false) {
            return Ok(HashMap::new());
        }

        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            ResolveError::Decode(format!("Corrupt cache file {}: {}", self.path.display(), e))
        })
    }

    /// Read for rewriting: a corrupt file is replaced rather than blocking writes
    fn read_map_or_reset<V: DeserializeOwned>(&self) -> HashMap<String, CacheEntry<V>> {
        match self.read_map() {
            Ok(map) => map,
            Err(e) => {
                warn!("Discarding unreadable cache file: {}", e);
                HashMap::new()
            }
        }
    }

    fn write_map<V: Serialize>(&self, map: &HashMap<String, CacheEntry<V>>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let tmp = NamedTempFile::new_in(&dir).map_err(|e| {
            ResolveError::Persistence(format!("Failed to create temp file in {}: {}", dir.display(), e))
        })?;

        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, map).map_err(|e| {
                ResolveError::Persistence(format!("Failed to encode cache: {}", e))
            })?;
            writer
                .flush()
                .map_err(|e| ResolveError::Persistence(format!("Failed to write cache: {}", e)))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| ResolveError::Persistence(format!("Failed to sync cache: {}", e)))?;

        tmp.persist(&self.path).map_err(|e| {
            ResolveError::Persistence(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}
