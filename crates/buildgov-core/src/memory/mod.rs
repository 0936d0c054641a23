//! Host memory accounting: snapshots, the probe trait, and probe
//! implementations.
//!
//! The controller's only pressure signal is the commit ratio: committed
//! memory over the commit limit. On hosts without native commit accounting
//! the probe maps the analogous quantities: the commit limit is physical
//! memory plus swap, the commit charge is the used portion of each. The
//! budget thresholds are configuration, so a different accounting basis can
//! be recalibrated without touching this module.

mod probe;

pub use probe::{StaticProbe, SystemProbe};

use thiserror::Error;

/// One gibibyte, the unit most of the budget math is expressed in.
pub const BYTES_PER_GIB: u64 = 1 << 30;

/// An immutable sample of host memory state at a point in time.
///
/// Created by a [`MemoryProbe`]; consumed by the budget engine and the
/// failure classifier. Never mutated after construction.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct MemorySnapshot {
    /// Total physical memory in bytes.
    pub total_physical: u64,
    /// Physical memory currently available in bytes.
    pub available_physical: u64,
    /// Committed virtual memory across the system, in bytes.
    pub commit_charge: u64,
    /// Maximum committed virtual memory the OS will allow, in bytes.
    pub commit_limit: u64,
    /// `commit_charge / commit_limit`, clamped to `[0.0, 1.0]`.
    pub commit_ratio: f64,
    /// Percentage of physical memory in use, 0–100.
    pub memory_load_percent: u32,
}

impl MemorySnapshot {
    /// Builds a snapshot from raw byte counts, deriving the commit ratio
    /// and the physical load percentage.
    ///
    /// A zero commit limit is treated as fully committed: if the probe
    /// cannot tell how much headroom exists, admission must assume none.
    #[must_use]
    pub fn new(
        total_physical: u64,
        available_physical: u64,
        commit_charge: u64,
        commit_limit: u64,
    ) -> Self {
        let commit_ratio = if commit_limit == 0 {
            1.0
        } else {
            (commit_charge as f64 / commit_limit as f64).clamp(0.0, 1.0)
        };
        let memory_load_percent = if total_physical == 0 {
            100
        } else {
            let used = total_physical.saturating_sub(available_physical);
            ((used * 100) / total_physical) as u32
        };
        Self {
            total_physical,
            available_physical,
            commit_charge,
            commit_limit,
            commit_ratio,
            memory_load_percent,
        }
    }

    /// The snapshot substituted when the probe fails: no headroom at all.
    ///
    /// Callers treat a probe failure as "assume worst case", never as a
    /// fatal error, so admission throttles hard until the probe recovers.
    #[must_use]
    pub fn worst_case() -> Self {
        Self {
            total_physical: 0,
            available_physical: 0,
            commit_charge: 0,
            commit_limit: 0,
            commit_ratio: 1.0,
            memory_load_percent: 100,
        }
    }

    /// Commit headroom remaining before the limit, in GiB.
    #[must_use]
    pub fn available_commit_gb(&self) -> f64 {
        self.commit_limit.saturating_sub(self.commit_charge) as f64 / BYTES_PER_GIB as f64
    }
}

/// Instantaneous memory use of one live child process.
///
/// The probe reports current values; callers that need peaks (the shim's
/// 10 Hz sampler) keep a running maximum across samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemory {
    /// Resident working-set bytes.
    pub working_set_bytes: u64,
    /// Committed (virtual) bytes.
    pub commit_bytes: u64,
}

/// Errors from the memory probe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProbeError {
    /// The OS metrics call failed or returned nothing usable.
    #[error("memory probe unavailable: {reason}")]
    Unavailable {
        /// Description of the underlying failure.
        reason: String,
    },
}

impl ProbeError {
    /// Creates an [`ProbeError::Unavailable`] with the given reason.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Source of host-wide and per-process memory samples.
///
/// `sample` must be cheap (sub-millisecond); the pool calls it under its
/// lock on every acquire, release, and maintenance tick.
pub trait MemoryProbe: Send + Sync {
    /// Reads host commit accounting in one call.
    fn sample(&self) -> Result<MemorySnapshot, ProbeError>;

    /// Returns the current memory use of a live child process, or `None`
    /// for exited or inaccessible processes.
    fn sample_process(&self, pid: u32) -> Option<ProcessMemory>;
}
