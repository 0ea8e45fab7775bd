//! Cross-process broadcast locking via exclusive-create lock files.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{LedgerError, Result};

/// Identifies the broadcast a lock protects. Stream-only captures use a
/// distinct suffix so a later VOD-backed run of the same broadcast is not
/// blocked by a stale stream-only lock name (and vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKey {
    Vod(u64),
    StreamOnly(u64),
}

impl LockKey {
    fn file_name(&self) -> String {
        match self {
            Self::Vod(id) => format!("{id}.lock"),
            Self::StreamOnly(id) => format!("{id}.lock-stream"),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Vod(id) => format!("vod {id}"),
            Self::StreamOnly(id) => format!("stream {id}"),
        }
    }
}

/// Held while one archiver instance owns a broadcast. Creating the lock file
/// with `create_new` is the mutual-exclusion primitive; a second instance
/// fails the create and skips the broadcast.
#[derive(Debug)]
pub struct BroadcastLock {
    path: PathBuf,
    released: bool,
}

impl BroadcastLock {
    pub fn acquire(lock_dir: &Path, key: LockKey) -> Result<Self> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(key.file_name());

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "broadcast lock acquired");
                Ok(Self {
                    path,
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LedgerError::Locked {
                key: key.describe(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "broadcast lock released");
        Ok(())
    }
}

impl Drop for BroadcastLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = BroadcastLock::acquire(dir.path(), LockKey::Vod(123)).unwrap();

        let second = BroadcastLock::acquire(dir.path(), LockKey::Vod(123));
        assert!(matches!(second, Err(LedgerError::Locked { .. })));

        lock.release().unwrap();
        BroadcastLock::acquire(dir.path(), LockKey::Vod(123)).unwrap();
    }

    #[test]
    fn stream_only_and_vod_locks_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let _a = BroadcastLock::acquire(dir.path(), LockKey::Vod(5)).unwrap();
        let _b = BroadcastLock::acquire(dir.path(), LockKey::StreamOnly(5)).unwrap();
    }

    #[test]
    fn drop_removes_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("77.lock");
        {
            let _lock = BroadcastLock::acquire(dir.path(), LockKey::Vod(77)).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
