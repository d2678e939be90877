//! Advisory locking of a channel during indexing.
//!
//! One lock file lives at the channel root (and a second at the output root
//! when they differ). Multiple locks are acquired with a try-all pattern:
//! if any lock cannot be taken immediately, everything already held is
//! released before retrying, so two processes can never wedge each other.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fslock::LockFile;
use thiserror::Error;

/// How long `index()` waits for the channel lock before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(900);

pub const LOCKFILE_NAME: &str = ".lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An error raised while locking a channel.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process held the lock for the whole timeout.
    #[error("channel is busy: could not lock {0} within the timeout")]
    ChannelBusy(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Held locks; released on drop.
#[derive(Debug)]
pub struct ChannelLocks {
    locks: Vec<LockFile>,
}

impl ChannelLocks {
    /// Number of lock files held.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Acquire a lock file in every given directory, or fail with
/// [`LockError::ChannelBusy`] after `timeout`.
pub fn acquire_channel_locks(
    roots: &[&Path],
    timeout: Duration,
) -> Result<ChannelLocks, LockError> {
    let paths: Vec<PathBuf> = roots.iter().map(|root| root.join(LOCKFILE_NAME)).collect();
    let mut locks = paths
        .iter()
        .map(|path| LockFile::open(path.as_os_str()))
        .collect::<Result<Vec<_>, _>>()?;

    let deadline = Instant::now() + timeout;
    loop {
        let mut acquired = 0;
        for lock in &mut locks {
            if lock.try_lock()? {
                acquired += 1;
            } else {
                break;
            }
        }
        if acquired == locks.len() {
            return Ok(ChannelLocks { locks });
        }
        // failed partway; release what we hold so the other process can finish
        for lock in locks.iter_mut().take(acquired) {
            lock.unlock()?;
        }
        if Instant::now() >= deadline {
            return Err(LockError::ChannelBusy(paths[acquired].clone()));
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn locks_are_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let held = acquire_channel_locks(&[dir.path()], Duration::from_secs(1)).unwrap();
        assert_eq!(held.len(), 1);

        let err = acquire_channel_locks(&[dir.path()], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, LockError::ChannelBusy(_)));

        drop(held);
        acquire_channel_locks(&[dir.path()], Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn two_roots_take_two_locks() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let held = acquire_channel_locks(&[a.path(), b.path()], Duration::from_secs(1)).unwrap();
        assert_eq!(held.len(), 2);
        assert!(!held.is_empty());
    }
}
