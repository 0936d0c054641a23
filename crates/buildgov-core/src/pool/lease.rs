//! Lease records and the pool's outcome types.

use std::time::{Duration, Instant};

use crate::budget::ThrottleLevel;
use crate::classify::Classification;
use crate::memory::MemorySnapshot;

/// An in-flight tool invocation holding tokens.
///
/// Owned exclusively by the pool from creation until release or expiry; the
/// pool is the only mutator.
#[derive(Debug, Clone)]
pub(crate) struct Lease {
    /// Opaque printable id, unique for the governor's lifetime.
    pub id: String,
    /// Free-form tool label, e.g. "cl" or "link".
    pub tool: String,
    /// Tokens held (zero is legal: tracked but unweighted).
    pub tokens: u32,
    /// When the lease was granted.
    pub acquired_at: Instant,
    /// `acquired_at + lease_ttl`; absolute, never extended.
    pub expires_at: Instant,
    /// Commit ratio observed at grant time, kept for the classifier.
    pub commit_ratio_at_acquire: f64,
    /// Set after the one-time long-running warning so it is not repeated.
    pub warning_logged: bool,
}

/// Result of [`TokenPool::try_acquire`](super::TokenPool::try_acquire).
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// Tokens were granted and a lease created.
    Granted(LeaseGrant),
    /// No lease was created.
    Denied {
        /// Why admission was refused (hard stop or timeout).
        reason: String,
        /// Suggested build-driver parallelism at decision time.
        recommended_parallelism: u32,
        /// Commit ratio at decision time.
        commit_ratio: f64,
    },
}

/// The granted half of an acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseGrant {
    /// Id to cite in `release` and `heartbeat`.
    pub lease_id: String,
    /// Tokens actually granted; may be fewer than requested.
    pub granted_tokens: u32,
    /// Suggested build-driver parallelism at grant time.
    pub recommended_parallelism: u32,
    /// Commit ratio at grant time.
    pub commit_ratio: f64,
}

/// What the shim observed about the finished invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Peak resident bytes of the child.
    pub peak_working_set_bytes: u64,
    /// Peak committed bytes of the child.
    pub peak_commit_bytes: u64,
    /// The tool's exit code.
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether stderr matched the tool's diagnostic predicate.
    pub stderr_had_diagnostics: bool,
}

/// Result of [`TokenPool::release`](super::TokenPool::release).
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseOutcome {
    /// False when the lease id was unknown; nothing happened.
    pub acknowledged: bool,
    /// Outcome label for the invocation.
    pub classification: Classification,
    /// Human-facing diagnostic for OOM-adjacent verdicts.
    pub message: Option<String>,
    /// Whether a retry with fewer tokens is advised.
    pub should_retry: bool,
    /// Token count to retry with, present iff a retry is advised.
    pub retry_with_tokens: Option<u32>,
}

impl ReleaseOutcome {
    /// The outcome for an unknown lease id.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            acknowledged: false,
            classification: Classification::Unknown,
            message: None,
            should_retry: false,
            retry_with_tokens: None,
        }
    }
}

/// Snapshot of pool state returned by
/// [`TokenPool::status`](super::TokenPool::status).
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStatus {
    /// Token capacity under the current budget.
    pub total_tokens: u32,
    /// Tokens not currently leased.
    pub available_tokens: u32,
    /// Number of active leases.
    pub active_leases: u32,
    /// Cumulative count of TTL reclamations.
    pub expired_leases: u64,
    /// The latest memory snapshot.
    pub snapshot: MemorySnapshot,
    /// Throttle band of the current budget.
    pub throttle_level: ThrottleLevel,
    /// Suggested build-driver parallelism.
    pub recommended_parallelism: u32,
    /// Up to ten most recently acquired active leases, newest first.
    pub recent_leases: Vec<LeaseInfo>,
}

/// One row of [`PoolStatus::recent_leases`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    /// The lease id.
    pub lease_id: String,
    /// Tool label.
    pub tool: String,
    /// Tokens held.
    pub tokens: u32,
    /// Time since the lease was acquired.
    pub running_for: Duration,
    /// Time until TTL reclamation.
    pub expires_in: Duration,
}
