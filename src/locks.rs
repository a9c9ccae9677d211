//! Cross-process lock coordination for one database.
//!
//! A named coordinator derived from the canonical database path hands out
//! any number of shared (read) locks or one exclusive (write) lock, using
//! advisory file locks on a sibling `<db>.lock` file.  Each guard owns its
//! own file handle, so lock lifetimes follow guard lifetimes exactly; the
//! lock releases on drop.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Lock: timed out waiting for the database lock.")]
    Timeout,
    #[error("Lock: error accessing lock file: {0}")]
    Io(#[from] std::io::Error),
}

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Derive the lock-file path for a database path.
pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

pub struct LockCoordinator {
    path: PathBuf,
}

/// Holds a shared or exclusive lock until dropped.
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the handle releases the lock anyway; unlock explicitly so
        // the release is not deferred by a dup'ed descriptor.
        let _ = self.file.unlock();
    }
}

impl LockCoordinator {
    pub fn new(db_path: &Path) -> Result<LockCoordinator, Error> {
        let path = lock_path(db_path);
        // Create the lock file up front so read-only databases can still
        // take shared locks.
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(LockCoordinator { path })
    }

    fn open_handle(&self) -> Result<File, Error> {
        Ok(OpenOptions::new().read(true).write(true).open(&self.path)?)
    }

    fn acquire<F>(&self, timeout: Duration, try_lock: F) -> Result<LockGuard, Error>
    where
        F: Fn(&File) -> std::io::Result<()>,
    {
        let file = self.open_handle()?;
        let deadline = Instant::now() + timeout;
        loop {
            match try_lock(&file) {
                Ok(()) => return Ok(LockGuard { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Any number of shared locks may be held concurrently; waits behind an
    /// exclusive holder.
    pub fn shared(&self, timeout: Duration) -> Result<LockGuard, Error> {
        self.acquire(timeout, |f| FileExt::try_lock_shared(f))
    }

    /// At most one exclusive lock; waits behind shared holders.
    pub fn exclusive(&self, timeout: Duration) -> Result<LockGuard, Error> {
        self.acquire(timeout, |f| FileExt::try_lock_exclusive(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("a.db");
        let c = LockCoordinator::new(&db).unwrap();
        let g1 = c.shared(Duration::from_millis(100)).unwrap();
        let _g2 = c.shared(Duration::from_millis(100)).unwrap();
        drop(g1);
    }

    #[test]
    fn test_exclusive_excludes_shared() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("a.db");
        let c = LockCoordinator::new(&db).unwrap();
        let writer = c.exclusive(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            c.shared(Duration::from_millis(50)),
            Err(Error::Timeout)
        ));
        drop(writer);
        assert!(c.shared(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_exclusive_waits_behind_shared() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("a.db");
        let c = LockCoordinator::new(&db).unwrap();
        let reader = c.shared(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            c.exclusive(Duration::from_millis(50)),
            Err(Error::Timeout)
        ));
        drop(reader);
        assert!(c.exclusive(Duration::from_millis(100)).is_ok());
    }
}
