//! Locking to make sure that multiple copies of `quarry` don't clobber each
//! other.
//!
//! The lock is an OS-level advisory exclusive lock on a small sibling file,
//! never on the guarded directory itself: the directory gets removed and
//! recreated during a re-download, and that must not invalidate a lock some
//! other process is still holding.

use fs2::FileExt;
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use crate::util::errors::Res;

/// A scoped exclusive lock on a path. Released on drop, on any exit path.
#[derive(Debug)]
pub struct FileLock {
    file: fs::File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock without blocking. Returns `None` when another
    /// process (or another handle in this process) holds it.
    pub fn try_lock<P: AsRef<Path>>(path: P) -> Res<Option<Self>> {
        let file = Self::open(path.as_ref())?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.as_ref().to_path_buf(),
            })),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // fs2 reports contention with the platform's own error code
            Err(ref e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Acquires the lock, blocking until the current holder releases it.
    /// File-system writes the holder performed inside its critical section
    /// are observable once this returns.
    pub fn lock<P: AsRef<Path>>(path: P) -> Res<Self> {
        let file = Self::open(path.as_ref())?;
        file.lock_exclusive()?;
        Ok(FileLock {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> Res<fs::File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(file)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_handle_contends() {
        let dir = tempdir::TempDir::new("lock").unwrap();
        let path = dir.path().join("pkg.lock");

        let held = FileLock::try_lock(&path).unwrap();
        assert!(held.is_some());
        assert!(FileLock::try_lock(&path).unwrap().is_none());

        drop(held);
        assert!(FileLock::try_lock(&path).unwrap().is_some());
    }

    #[test]
    fn blocking_lock_waits_for_release() {
        use std::{sync::mpsc, thread, time::Duration};

        let dir = tempdir::TempDir::new("lock").unwrap();
        let path = dir.path().join("pkg.lock");

        let held = FileLock::try_lock(&path).unwrap().unwrap();
        let (tx, rx) = mpsc::channel();
        let p = path.clone();
        let t = thread::spawn(move || {
            let _l = FileLock::lock(&p).unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        t.join().unwrap();
    }
}
