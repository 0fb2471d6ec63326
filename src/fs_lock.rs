//! Filesystem-based build lock for cross-process coordination
//!
//! One `build.lock` file lives in each `incremental/<mode>/` directory. Holding an
//! exclusive flock() on it means this process is the only one mutating that mode's
//! bundles and manifest.

use crate::error::{CacheError, LockError};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Guard that holds an exclusive filesystem lock
///
/// The lock is automatically released when this guard is dropped.
/// If the process crashes, the OS automatically releases the flock.
#[derive(Debug)]
pub struct BuildLockGuard {
    _file: File,
    path: PathBuf,
}

impl BuildLockGuard {
    /// Try to acquire the lock without waiting
    ///
    /// Returns:
    /// - `Ok(Some(guard))` if the lock was acquired
    /// - `Ok(None)` if another process holds the lock
    /// - `Err(...)` on IO errors
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CacheError> {
        let failed = |reason: String| LockError::AcquireFailed {
            path: lock_path.display().to_string(),
            reason,
        };

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| failed(format!("failed to create lock directory: {}", e)))?;
        }

        let file = File::create(lock_path)
            .map_err(|e| failed(format!("failed to create lock file: {}", e)))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired build lock {:?}", lock_path);
                Ok(Some(Self {
                    _file: file,
                    path: lock_path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::debug!("Build lock {:?} held by another process", lock_path);
                Ok(None)
            }
            Err(e) => Err(failed(e.to_string()).into()),
        }
    }

    /// Poll for the lock until it is acquired or `timeout` expires
    pub async fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, CacheError> {
        let start = Instant::now();
        let sleep_interval = Duration::from_millis(250).min(timeout.max(Duration::from_millis(10)));

        loop {
            if let Some(guard) = Self::try_acquire(lock_path)? {
                if start.elapsed() > sleep_interval {
                    tracing::info!("Acquired build lock after {:?}", start.elapsed());
                }
                return Ok(guard);
            }
            if start.elapsed() >= timeout {
                tracing::warn!(
                    "Timeout waiting for build lock {:?} after {:?}",
                    lock_path,
                    timeout
                );
                return Err(LockError::Busy(lock_path.display().to_string()).into());
            }
            tokio::time::sleep(sleep_interval).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildLockGuard {
    fn drop(&mut self) {
        // The lock file is kept for reuse; closing it releases the flock
        tracing::debug!("Releasing build lock {:?}", self.path);
    }
}
