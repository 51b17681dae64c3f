//! Advisory lock serialising store writes across processes.
//!
//! A sibling `<store>.lock` file is held with `flock(LOCK_EX)` for the whole
//! reload, mutate and persist sequence, so a CLI import and a running mount
//! never interleave their read-modify-write cycles.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt as _;
use std::os::unix::io::AsRawFd as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub(crate) struct StoreLock {
    path: PathBuf,
}

/// Holds the exclusive lock until dropped.
#[derive(Debug)]
pub(crate) struct StoreLockGuard {
    file: File,
}

impl StoreLock {
    pub(crate) fn for_store(store_path: &Path) -> Self {
        let mut name = store_path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        Self {
            path: store_path.with_file_name(name),
        }
    }

    /// Block until the exclusive lock is held.
    pub(crate) fn acquire(&self) -> std::io::Result<StoreLockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)?;
        loop {
            // SAFETY: the fd is owned by `file` and open for the call.
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                return Ok(StoreLockGuard { file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        // Closing the fd releases the lock as well; unlock early regardless.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn lock_file_sits_next_to_the_store() {
        let lock = StoreLock::for_store(Path::new("/data/keyshare/store.json"));
        assert_eq!(lock.path, Path::new("/data/keyshare/store.json.lock"));
    }

    #[test]
    fn second_holder_waits_for_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let lock = StoreLock::for_store(&dir.path().join("store.json"));
        let guard = lock.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = lock.clone();
        let handle = std::thread::spawn(move || {
            let _guard = contender.acquire().unwrap();
            tx.send(()).unwrap();
        });

        // flock locks belong to the open file description, so a second open
        // in the same process contends like another process would.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }
}
