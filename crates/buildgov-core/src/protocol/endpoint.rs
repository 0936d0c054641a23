//! Stable endpoint and lock naming.
//!
//! Shims and the governor rendezvous on well-known names that survive
//! restarts: the endpoint "BuildGovernor" and the two system-wide mutexes
//! "BuildGovernorInstance" and "BuildGovernorMutex". On this platform the
//! endpoint is a Unix domain socket and the mutexes are `flock`-ed files,
//! all inside one per-user runtime directory.

use std::path::PathBuf;

/// Documented endpoint name.
pub const ENDPOINT_NAME: &str = "BuildGovernor";
/// Documented name of the instance mutex.
pub const INSTANCE_MUTEX_NAME: &str = "BuildGovernorInstance";
/// Documented name of the launcher-election mutex.
pub const LAUNCH_MUTEX_NAME: &str = "BuildGovernorMutex";

/// Environment variable overriding the runtime directory root.
pub const RUNTIME_DIR_ENV: &str = "GOV_RUNTIME_DIR";

/// The per-user runtime directory holding the socket and lock files.
///
/// Resolution order: `GOV_RUNTIME_DIR`, then `$XDG_RUNTIME_DIR/build-governor`,
/// then `/tmp/build-governor-<uid>`. The name is stable across restarts so
/// shims can always rendezvous.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(RUNTIME_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(xdg) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(xdg).join("build-governor");
    }
    PathBuf::from(format!("/tmp/build-governor-{}", current_uid()))
}

/// Path of the governor's listening socket.
#[must_use]
pub fn socket_path() -> PathBuf {
    runtime_dir().join("governor.sock")
}

/// Path of the instance lock file ("BuildGovernorInstance").
#[must_use]
pub fn instance_lock_path() -> PathBuf {
    runtime_dir().join("instance.lock")
}

/// Path of the launcher-election lock file ("BuildGovernorMutex").
#[must_use]
pub fn launch_lock_path() -> PathBuf {
    runtime_dir().join("launch.lock")
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn current_uid() -> u32 {
    // SAFETY: getuid takes no arguments, cannot fail, and has no
    // memory-safety implications.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
