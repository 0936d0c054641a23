//! `flock(2)` helpers backing the governor's named-mutex discipline.
//!
//! Two locks exist, both files in the runtime directory:
//!
//! - the instance lock ("BuildGovernorInstance"), held by the running
//!   governor for the life of the process so at most one instance binds the
//!   endpoint;
//! - the launch lock ("BuildGovernorMutex"), held briefly by the one shim
//!   that elects itself launcher during auto-start.
//!
//! A lock is released when its [`LockFile`] is dropped (the descriptor is
//! closed), so holders just keep the value alive.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

/// An open, `flock`-ed lock file. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockFile {
    _file: File,
}

/// Attempts to take the exclusive lock without blocking.
///
/// Returns `Ok(None)` when another process holds it.
pub fn try_exclusive(path: &Path) -> io::Result<Option<LockFile>> {
    let file = open_lock_file(path)?;
    if flock_exclusive_nonblocking(&file)? {
        Ok(Some(LockFile { _file: file }))
    } else {
        Ok(None)
    }
}

/// Attempts to take the exclusive lock, retrying until `wait` elapses.
///
/// Used for launcher election: several shims may race here, and the losers
/// either see the lock freed in time or give up and re-check the endpoint
/// anyway. Returns `Ok(None)` on timeout.
pub fn exclusive_within(path: &Path, wait: Duration) -> io::Result<Option<LockFile>> {
    const RETRY: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + wait;
    loop {
        if let Some(lock) = try_exclusive(path)? {
            return Ok(Some(lock));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(RETRY);
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn flock_exclusive_nonblocking(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid descriptor from an open `std::fs::File` that
    // outlives this call, and `LOCK_EX | LOCK_NB` is a valid `flock`
    // operation with no memory-safety implications.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn flock_exclusive_nonblocking(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_within_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");

        let held = try_exclusive(&path).unwrap();
        assert!(held.is_some());

        // flock is per-open-file-description: a second open in the same
        // process still contends.
        let second = try_exclusive(&path).unwrap();
        assert!(second.is_none());

        drop(held);
        let third = try_exclusive(&path).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn exclusive_within_times_out_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launch.lock");

        let held = try_exclusive(&path).unwrap().unwrap();
        let lost = exclusive_within(&path, Duration::from_millis(250)).unwrap();
        assert!(lost.is_none());

        drop(held);
        let won = exclusive_within(&path, Duration::from_millis(250)).unwrap();
        assert!(won.is_some());
    }

    #[test]
    fn two_contenders_elect_exactly_one_winner() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launch.lock");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let lock = try_exclusive(&path).unwrap();
                    let won = lock.is_some();
                    // Hold any win until both contenders have attempted.
                    barrier.wait();
                    won
                })
            })
            .collect();

        let wins: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            wins.iter().filter(|w| **w).count(),
            1,
            "exactly one contender must win, got {wins:?}"
        );
    }
}
