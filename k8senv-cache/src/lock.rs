//! A cross-process exclusive lock on a sibling `.lock` file next to a cache
//! entry.
//!
//! Grounded on the advisory-lock pattern of acquiring the lock file first
//! (before truncating or writing anything) via `fs2::FileExt`: open (create
//! if absent), `try_lock_exclusive`, retry on contention. The lock file is
//! intentionally never removed — unlinking it while another process holds
//! or is about to acquire it can let two processes both believe they hold
//! exclusive access.

use fs2::FileExt;
use snafu::{ResultExt, Snafu};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Snafu)]
pub enum LockError {
    #[snafu(display("failed to open lock file {path:?}: {source}"))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to acquire lock file {path:?}: {source}"))]
    Acquire {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cancelled while waiting for lock file {path:?}"))]
    Cancelled { path: PathBuf },
}

/// A held exclusive lock. Releases on drop (both the OS advisory lock and,
/// implicitly, the open file descriptor); the lock file itself stays on
/// disk.
pub struct CacheLock {
    _file: File,
    path: PathBuf,
}

impl CacheLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Block until the exclusive lock at `path` is obtained or `cancel` fires.
pub async fn acquire(path: &Path, cancel: &CancellationToken) -> Result<CacheLock, LockError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .context(OpenSnafu {
            path: path.to_path_buf(),
        })?;

    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                trace!(?path, "acquired cache lock");
                return Ok(CacheLock {
                    _file: file,
                    path: path.to_path_buf(),
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if cancel.is_cancelled() {
                    return CancelledSnafu {
                        path: path.to_path_buf(),
                    }
                    .fail();
                }
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    _ = cancel.cancelled() => {
                        return CancelledSnafu { path: path.to_path_buf() }.fail();
                    }
                }
            }
            Err(source) => {
                return Err(LockError::Acquire {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_an_uncontended_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db.lock");
        let lock = acquire(&path, &CancellationToken::new()).await.unwrap();
        assert_eq!(lock.path(), path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn lock_file_is_not_removed_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db.lock");
        {
            let _lock = acquire(&path, &CancellationToken::new()).await.unwrap();
        }
        assert!(path.exists());
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_contended_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db.lock");
        let _holder = acquire(&path, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let result = acquire(&path, &cancel).await;
        assert!(matches!(result, Err(LockError::Cancelled { .. })));
    }
}
