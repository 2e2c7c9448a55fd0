//! Per-cluster advisory file lock.
//!
//! The storage root lives on a filesystem shared by every cluster's poller;
//! POSIX advisory locking on `state/lock` serializes all writers of one
//! cluster subtree. The lock is held for the entire tick and released on
//! drop, including on panic unwind.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::{Error, Result};

/// An exclusively held cluster lock. Dropping releases it.
#[derive(Debug)]
pub struct ClusterLock {
    file: File,
}

impl ClusterLock {
    /// Non-blocking exclusive acquire. A contended lock is not an error
    /// condition; it maps to the distinguished lock-held exit status.
    pub fn acquire(path: &Path) -> Result<ClusterLock> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(ClusterLock { file }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(Error::LockHeld)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
