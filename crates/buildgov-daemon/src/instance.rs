//! Single-instance discipline.
//!
//! The running governor holds "BuildGovernorInstance" (an exclusive flock)
//! for the life of the process. A second governor starting on the same host
//! finds the lock held and exits 0: the other instance is authoritative
//! and the exit is not an error, because shims routinely race to auto-start
//! one.

use std::io;
use std::path::Path;

use buildgov_core::lockfile::{self, LockFile};
use tracing::debug;

/// The held instance lock. Keep it alive for the life of the daemon;
/// dropping it lets the next governor start.
#[derive(Debug)]
pub struct InstanceLock {
    _lock: LockFile,
}

/// Attempts to become the single governor instance.
///
/// Returns `Ok(None)` when another instance already holds the lock.
pub fn acquire(path: &Path) -> io::Result<Option<InstanceLock>> {
    match lockfile::try_exclusive(path)? {
        Some(lock) => {
            debug!(path = %path.display(), "instance lock acquired");
            Ok(Some(InstanceLock { _lock: lock }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_refused_until_first_exits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");

        let first = acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(acquire(&path).unwrap().is_none());

        drop(first);
        assert!(acquire(&path).unwrap().is_some());
    }
}
