// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable disk tier.
//!
//! One file per cache key, named by the SHA-256 of the key. Writes go to a
//! temp file that is renamed into place, so a crash never leaves a torn
//! entry behind. Eviction by size and age is a separate sweep guarded by a
//! lock file, so two processes sharing a cache directory never sweep at once.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// How long a sweep waits for another process's sweep to finish.
const SWEEP_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for the sweep lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const SWEEP_LOCK_FILE: &str = ".sweep.lock";
const TEMP_SUFFIX: &str = "tmp";

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Serialize)]
pub struct EvictionReport {
    pub expired_removed: usize,
    pub oversize_removed: usize,
    pub bytes_freed: u64,
    pub bytes_remaining: u64,
    pub swept_at: DateTime<Utc>,
}

/// Key/value byte store backing the disk tier.
///
/// All methods block; callers run them on the blocking pool.
pub trait DiskStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn contains(&self, key: &str) -> bool;

    fn clear(&self) -> Result<()>;

    /// Drop entries older than `max_age`, then oldest entries until the
    /// store fits in `max_size`. Zero disables either bound.
    fn evict(&self, max_size: u64, max_age: Duration) -> Result<EvictionReport>;

    fn total_size(&self) -> u64;

    fn count(&self) -> usize;
}

/// File-per-key disk store.
#[derive(Debug)]
pub struct FileDiskStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

struct StoredFile {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

impl FileDiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create disk cache directory: {:?}", root))?;
        Ok(Self {
            root,
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Default location: `<system cache dir>/webimg/images`.
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .map(|d| d.join("webimg").join("images"))
            .unwrap_or_else(|| PathBuf::from(".webimg/images"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join(hex::encode(digest))
    }

    fn is_entry(path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !name.starts_with('.') && path.extension().map_or(true, |ext| ext != TEMP_SUFFIX)
    }

    fn entries(&self) -> Result<Vec<StoredFile>> {
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list disk cache: {:?}", self.root))?
        {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if !Self::is_entry(&path) {
                continue;
            }
            let meta = match dir_entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            files.push(StoredFile {
                path,
                len: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }

    /// Acquire the exclusive sweep lock, waiting up to `timeout`.
    fn acquire_sweep_lock(&self, timeout: Duration) -> Result<File> {
        let path = self.root.join(SWEEP_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open sweep lock: {:?}", path))?;

        let start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for sweep lock on {:?} after {:?}. \
                             Another process may be sweeping this cache.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to lock {:?}", path));
                }
            }
        }
    }
}

impl DiskStore for FileDiskStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read cache entry for {}", key)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = path.with_extension(format!("{}.{}", n, TEMP_SUFFIX));

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(data)
                .with_context(|| "Failed to write cache entry")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync cache entry to disk")?;
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e)
                .with_context(|| format!("Failed to move cache entry into place: {:?}", path));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove cache entry for {}", key)),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    fn clear(&self) -> Result<()> {
        for file in self.entries()? {
            fs::remove_file(&file.path)
                .with_context(|| format!("Failed to remove {:?}", file.path))?;
        }
        Ok(())
    }

    fn evict(&self, max_size: u64, max_age: Duration) -> Result<EvictionReport> {
        let _lock_guard = self.acquire_sweep_lock(SWEEP_LOCK_TIMEOUT)?;

        let now = SystemTime::now();
        let mut report = EvictionReport {
            expired_removed: 0,
            oversize_removed: 0,
            bytes_freed: 0,
            bytes_remaining: 0,
            swept_at: Utc::now(),
        };

        let mut kept = Vec::new();
        for file in self.entries()? {
            let age = now.duration_since(file.modified).unwrap_or(Duration::ZERO);
            if !max_age.is_zero() && age > max_age {
                if fs::remove_file(&file.path).is_ok() {
                    report.expired_removed += 1;
                    report.bytes_freed += file.len;
                }
            } else {
                kept.push(file);
            }
        }

        let mut total: u64 = kept.iter().map(|f| f.len).sum();
        if max_size > 0 && total > max_size {
            // Shrink to half the budget so the next few writes don't
            // immediately trigger another sweep.
            let target = max_size / 2;
            kept.sort_by_key(|f| f.modified);
            for file in &kept {
                if total <= target {
                    break;
                }
                if fs::remove_file(&file.path).is_ok() {
                    total -= file.len;
                    report.oversize_removed += 1;
                    report.bytes_freed += file.len;
                }
            }
        }
        report.bytes_remaining = total;
        Ok(report)
    }

    fn total_size(&self) -> u64 {
        self.entries()
            .map(|files| files.iter().map(|f| f.len).sum())
            .unwrap_or(0)
    }

    fn count(&self) -> usize {
        self.entries().map(|files| files.len()).unwrap_or(0)
    }
}
