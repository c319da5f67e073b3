//! Advisory file locks for the file driver.

use std::fs::File;
use std::io;

use fs4::fs_std::FileExt;
use tracing::warn;

/// An exclusive advisory lock held on a file until dropped.
#[derive(Debug)]
pub(crate) struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    /// Tries to take an exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` when another holder already has the lock.
    pub(crate) fn try_exclusive(file: &'a File) -> io::Result<Option<Self>> {
        match FileExt::try_lock_exclusive(file) {
            Ok(true) => Ok(Some(Self { file })),
            Ok(false) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn file(&self) -> &File {
        self.file
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            warn!(error = %e, "Failed to release file lock");
        }
    }
}
