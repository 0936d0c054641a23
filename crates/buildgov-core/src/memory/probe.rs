//! Probe implementations: the sysinfo-backed host probe and a fixed probe
//! for tests and simulations.

use std::sync::Mutex;

use sysinfo::{
    MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System,
};

use super::{MemoryProbe, MemorySnapshot, ProbeError, ProcessMemory};

/// Host probe backed by the `sysinfo` crate.
///
/// Commit accounting is mapped onto what this platform exposes:
/// `commit_limit = total memory + total swap`, `commit_charge = used memory
/// + used swap`. Refreshing only the memory counters keeps a sample well
/// under a millisecond.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    /// Creates a probe with only the memory refresh specifics enabled.
    #[must_use]
    pub fn new() -> Self {
        let refresh = RefreshKind::new().with_memory(MemoryRefreshKind::everything());
        Self {
            system: Mutex::new(System::new_with_specifics(refresh)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, System> {
        // A poisoned guard still holds valid sysinfo state; recover it
        // rather than propagating a panic from an unrelated thread.
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn sample(&self) -> Result<MemorySnapshot, ProbeError> {
        let mut sys = self.lock();
        sys.refresh_memory();

        let total_physical = sys.total_memory();
        if total_physical == 0 {
            return Err(ProbeError::unavailable("total physical memory reads zero"));
        }

        let commit_limit = total_physical.saturating_add(sys.total_swap());
        let commit_charge = sys.used_memory().saturating_add(sys.used_swap());

        Ok(MemorySnapshot::new(
            total_physical,
            sys.available_memory(),
            commit_charge,
            commit_limit,
        ))
    }

    fn sample_process(&self, pid: u32) -> Option<ProcessMemory> {
        let mut sys = self.lock();
        let target = Pid::from_u32(pid);
        let refreshed = sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        if refreshed == 0 {
            return None;
        }
        sys.process(target).map(|proc| ProcessMemory {
            working_set_bytes: proc.memory(),
            commit_bytes: proc.virtual_memory(),
        })
    }
}

/// Probe returning a fixed snapshot, or a fixed failure.
///
/// Lets pool and protocol tests drive the budget engine through specific
/// pressure regimes without depending on the host the tests run on.
pub struct StaticProbe {
    snapshot: Mutex<Result<MemorySnapshot, String>>,
}

impl StaticProbe {
    /// Creates a probe that always returns `snapshot`.
    #[must_use]
    pub fn new(snapshot: MemorySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Ok(snapshot)),
        }
    }

    /// Creates a probe that always fails with the given reason.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            snapshot: Mutex::new(Err(reason.into())),
        }
    }

    /// Replaces the snapshot returned by subsequent samples.
    pub fn set(&self, snapshot: MemorySnapshot) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Ok(snapshot);
    }

    /// Makes subsequent samples fail with the given reason.
    pub fn set_failing(&self, reason: impl Into<String>) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Err(reason.into());
    }
}

impl MemoryProbe for StaticProbe {
    fn sample(&self) -> Result<MemorySnapshot, ProbeError> {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .map_err(ProbeError::unavailable)
    }

    fn sample_process(&self, _pid: u32) -> Option<ProcessMemory> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BYTES_PER_GIB;

    #[test]
    fn system_probe_samples_the_host() {
        let probe = SystemProbe::new();
        let snap = probe.sample().expect("host memory should be readable");
        assert!(snap.total_physical > 0);
        assert!(snap.commit_limit >= snap.total_physical);
        assert!((0.0..=1.0).contains(&snap.commit_ratio));
    }

    #[test]
    fn system_probe_samples_own_process() {
        let probe = SystemProbe::new();
        let mem = probe
            .sample_process(std::process::id())
            .expect("own process should be sampleable");
        assert!(mem.working_set_bytes > 0);
    }

    #[test]
    fn system_probe_returns_none_for_dead_pid() {
        let probe = SystemProbe::new();
        // PIDs near the u32 ceiling are not valid live processes.
        assert!(probe.sample_process(u32::MAX - 7).is_none());
    }

    #[test]
    fn static_probe_round_trips_and_fails_on_demand() {
        let snap = MemorySnapshot::new(
            32 * BYTES_PER_GIB,
            16 * BYTES_PER_GIB,
            20 * BYTES_PER_GIB,
            40 * BYTES_PER_GIB,
        );
        let probe = StaticProbe::new(snap);
        assert_eq!(probe.sample().unwrap(), snap);

        probe.set_failing("simulated outage");
        assert!(probe.sample().is_err());

        probe.set(snap);
        assert_eq!(probe.sample().unwrap(), snap);
    }
}
