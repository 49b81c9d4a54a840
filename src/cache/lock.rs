//! Cross-process cache locks
//!
//! One lock file per cache volume, held with `flock` through `fs2`.
//! Builders writing a cache hold it exclusively; readers seeding a private
//! copy hold it shared. The lock is released when the guard drops.

use crate::error::{KilnError, KilnResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Interval between lock attempts while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lock discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many holders at once, no writers
    Shared,
    /// Single holder
    Exclusive,
}

/// A held cache lock
#[derive(Debug)]
pub struct CacheLock {
    /// The lock file handle (kept open to maintain lock)
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl CacheLock {
    fn open(path: &Path) -> KilnResult<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| KilnError::io(format!("opening lock file {}", path.display()), e))
    }

    /// Try to take the lock without waiting.
    ///
    /// Returns `Ok(None)` when another holder conflicts. `FileExt` is
    /// named explicitly: std `File` has inherent methods of the same name.
    pub fn try_acquire(path: &Path, mode: LockMode) -> KilnResult<Option<Self>> {
        let file = Self::open(path)?;

        let result = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };

        match result {
            Ok(()) => {
                debug!("Acquired {:?} lock {}", mode, path.display());
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                    mode,
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(KilnError::io(format!("locking {}", path.display()), e)),
        }
    }

    /// Wait for the lock, giving up after `timeout`.
    ///
    /// Polls instead of blocking in `flock` so the wait stays cancellable
    /// and bounded.
    pub async fn acquire(
        path: &Path,
        volume: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> KilnResult<Self> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(lock) = Self::try_acquire(path, mode)? {
                return Ok(lock);
            }

            if started.elapsed() >= timeout {
                return Err(KilnError::CacheLockTimeout {
                    volume: volume.to_string(),
                    waited: timeout,
                });
            }

            if !announced {
                tracing::info!("Waiting for cache {} (held by another build)", volume);
                announced = true;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Check whether some process holds the lock exclusively
    pub fn is_busy(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        matches!(Self::try_acquire(path, LockMode::Shared), Ok(None))
    }

    /// Lock discipline of this guard
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released {:?} lock {}", self.mode, self.path.display());
    }
}
