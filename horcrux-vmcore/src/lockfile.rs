//! Cooperative file locking shared by the config lock and hugepage
//! allocation lock: `nix::fcntl::flock`, with `EAGAIN` mapped to a typed
//! "someone else has it" error, wrapped in a reusable guard any component
//! can acquire around a read-modify-write section.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::fcntl::{flock, FlockArg};

use crate::error::{Error, Result};

pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Blocks until the lock is acquired. Used for the VM config lock,
    /// which must be held for the entire read-modify-write cycle, not just
    /// the write.
    pub fn acquire_blocking(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| Error::Locked {
            vmid: path.display().to_string(),
            lock: e.to_string(),
        })?;
        Ok(Self { _file: file })
    }

    /// Non-blocking acquisition, used for the hugepage allocation lock so a
    /// concurrent VM start fails fast with a clear error instead of
    /// queueing behind an unrelated allocation.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| Error::Locked {
            vmid: path.display().to_string(),
            lock: format!("another allocation is in progress: {e}"),
        })?;
        Ok(Self { _file: file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(self._file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_nonblocking_acquire_on_same_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let first = FileLock::try_acquire(&path).unwrap();
        let second = FileLock::try_acquire(&path);
        assert!(second.is_err());
        drop(first);
        assert!(FileLock::try_acquire(&path).is_ok());
    }
}
