// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Host-wide advisory locks on a zero-byte file.

use nix::errno::Errno;
use nix::fcntl::Flock;
use nix::fcntl::FlockArg;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileLockError {
    #[error("open lock file {path}: {source}")]
    Open { path: PathBuf, source: std::io::Error },

    #[error("flock {path}: {errno}")]
    Lock { path: PathBuf, errno: Errno },

    #[error("lock task failed: {0}")]
    Join(String),
}

/// A named exclusive lock, shared by every process on the host that
/// opens the same path.
#[derive(Clone, Debug)]
pub struct FileLock {
    path: PathBuf,
}

/// Held while the lock is taken. Dropping it unlocks.
#[derive(Debug)]
pub struct FileLockGuard {
    _flock: Flock<File>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block the calling thread until the lock is acquired.
    pub fn lock_blocking(&self) -> Result<FileLockGuard, FileLockError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| FileLockError::Open {
                path: self.path.clone(),
                source,
            })?;

        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(
            |(_, errno)| FileLockError::Lock { path: self.path.clone(), errno },
        )?;

        Ok(FileLockGuard { _flock: flock })
    }

    /// Acquire the lock without blocking the async runtime.
    pub async fn lock(&self) -> Result<FileLockGuard, FileLockError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.lock_blocking())
            .await
            .map_err(|e| FileLockError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iptables.lock");
        let lock = FileLock::new(&path);
        let guard = lock.lock_blocking().unwrap();
        assert!(path.exists());
        drop(guard);
    }

    #[test]
    fn excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let guard = FileLock::new(&path).lock_blocking().unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        let p = path.clone();
        let waiter = std::thread::spawn(move || {
            let _g = FileLock::new(&p).lock_blocking().unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn async_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("lock"));
        let g = lock.lock().await.unwrap();
        drop(g);
        let _g = lock.lock().await.unwrap();
    }
}
