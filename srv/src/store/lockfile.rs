//! Lockfile implementation.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::warn;

use super::error::{Result, StoreError};

/// Exclusive lock on the store directory.
///
/// The lock belongs to the open file, so it goes away with the process and
/// a crash never leaves the directory locked.
#[derive(Debug)]
pub struct Lockfile {
    handle: File,
    path: PathBuf,
}

impl Lockfile {
    /// Take the lock at `path`. Fails with `AlreadyLocked` if someone holds it.
    pub fn lock(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let handle = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(StoreError::file_io("open", path))?;

        if let Err(e) = handle.try_lock_exclusive() {
            let contended = fs2::lock_contended_error();
            return if e.kind() == contended.kind() || e.raw_os_error() == contended.raw_os_error() {
                Err(StoreError::AlreadyLocked)
            } else {
                Err(StoreError::file_io("lock", path)(e))
            };
        }

        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let Err(e) = self.handle.unlock() {
            warn!("failed to unlock {}: {}", self.path.display(), e);
        }
    }
}
