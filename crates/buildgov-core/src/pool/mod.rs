//! Token pool and lease manager.
//!
//! The pool serializes every token decision behind one lock: grants,
//! releases, status queries, and the periodic sweep all mutate or read
//! under it. The budget is recomputed from a fresh memory snapshot at every
//! acquire, release, and maintenance tick, so capacity tracks live commit
//! pressure rather than a startup constant.
//!
//! # Lease lifecycle
//!
//! ```text
//!     (acquire succeeds)              (release)
//!     ─────────────────▶  Active  ───────────────▶  Closed
//!                           │
//!                           │ now >= expires_at
//!                           ▼
//!                         Expired (tokens reclaimed, reclamation logged)
//! ```
//!
//! Expiry is the only protection against crashed shims holding tokens
//! forever; releases for an expired id are acknowledged `false` and have no
//! effect.
//!
//! # Reconciliation
//!
//! When a recomputed budget changes `total_tokens`, the available count is
//! rebuilt as `max(0, new_total - in_use)`. Outstanding leases always keep
//! their grant; a shrinking budget reduces admission, it never revokes. The
//! stranded case (`new_total < in_use`) is logged so operators can see why
//! admission is throttled while heavy tools keep running.

mod lease;


pub use lease::{
    AcquireOutcome, LeaseGrant, LeaseInfo, PoolStatus, ReleaseOutcome, ReleaseReport,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::budget::{self, ThrottleLevel, TokenBudget, TokenBudgetConfig};
use crate::classify::{classify, ClassifierConfig, ClassifyInput};
use crate::memory::{MemoryProbe, MemorySnapshot};

use lease::Lease;

/// How long a lease lives before the sweep reclaims it.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30 * 60);
/// Age at which a still-running lease earns a one-time warning log.
pub const DEFAULT_LONG_RUNNING_WARNING: Duration = Duration::from_secs(10 * 60);
/// Cadence of the maintenance sweep (and the probe refresh it carries).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Number of lease rows reported by [`TokenPool::status`].
const STATUS_RECENT_LEASES: usize = 10;

/// Pool configuration: the budget knobs plus the pool's own timing.
///
/// Timing is configurable so TTL behavior can be tested in milliseconds;
/// production uses the defaults.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Budget knobs handed to the engine on every recompute.
    pub budget: TokenBudgetConfig,
    /// Lease time-to-live; absolute, never extended.
    pub lease_ttl: Duration,
    /// Age at which a lease is flagged as long-running (once).
    pub long_running_warning: Duration,
    /// Maintenance sweep cadence.
    pub sweep_interval: Duration,
    /// Acquire retry delay while the throttle level is Normal.
    pub normal_retry_delay: Duration,
    /// Acquire retry delay in the Caution band.
    pub caution_retry_delay: Duration,
    /// Acquire retry delay in the SoftStop band.
    pub soft_stop_retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            budget: TokenBudgetConfig::default(),
            lease_ttl: DEFAULT_LEASE_TTL,
            long_running_warning: DEFAULT_LONG_RUNNING_WARNING,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            normal_retry_delay: Duration::from_millis(100),
            caution_retry_delay: Duration::from_millis(200),
            soft_stop_retry_delay: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Retry delay for one spin of the acquire loop at the given level.
    #[must_use]
    pub fn retry_delay(&self, level: ThrottleLevel) -> Duration {
        match level {
            ThrottleLevel::Normal => self.normal_retry_delay,
            ThrottleLevel::Caution => self.caution_retry_delay,
            // HardStop never spins (it denies immediately), so any caller
            // asking for its delay gets the most conservative one.
            ThrottleLevel::SoftStop | ThrottleLevel::HardStop => self.soft_stop_retry_delay,
        }
    }
}

struct PoolInner {
    total_tokens: u32,
    available_tokens: u32,
    snapshot: MemorySnapshot,
    budget: TokenBudget,
    leases: HashMap<String, Lease>,
    expired_leases: u64,
    probe_failed: bool,
    budget_stranded: bool,
}

/// The token pool. One per governor process; shared via `Arc`.
pub struct TokenPool {
    config: PoolConfig,
    classifier: ClassifierConfig,
    probe: Arc<dyn MemoryProbe>,
    inner: Mutex<PoolInner>,
}

impl TokenPool {
    /// Creates a pool, seeding the budget from an immediate probe sample.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        classifier: ClassifierConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let snapshot = probe
            .sample()
            .unwrap_or_else(|_| MemorySnapshot::worst_case());
        let initial = budget::compute(&snapshot, &config.budget);
        let inner = PoolInner {
            total_tokens: initial.total_tokens,
            available_tokens: initial.total_tokens,
            snapshot,
            budget: initial,
            leases: HashMap::new(),
            expired_leases: 0,
            probe_failed: false,
            budget_stranded: false,
        };
        Self {
            config,
            classifier,
            probe,
            inner: Mutex::new(inner),
        }
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of currently active leases.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.lock().leases.len()
    }

    /// Requests `requested_tokens` for `tool`, spinning until granted or
    /// `timeout` elapses.
    ///
    /// Returns within `timeout` plus one retry interval. A hard stop denies
    /// immediately; otherwise a partial grant is returned as soon as any
    /// token frees up, and a zero-token request is always admitted (it
    /// still creates a lease so the invocation is tracked).
    pub async fn try_acquire(
        &self,
        tool: &str,
        requested_tokens: u32,
        timeout: Duration,
    ) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let (delay, parallelism, ratio) = {
                let mut inner = self.lock();
                self.refresh(&mut inner);

                if inner.budget.throttle_level == ThrottleLevel::HardStop {
                    return AcquireOutcome::Denied {
                        reason: format!(
                            "hard stop: commit ratio {:.2} >= {:.2}; retry with \
                             parallelism {} or lower",
                            inner.snapshot.commit_ratio,
                            self.config.budget.hard_stop_ratio,
                            inner.budget.recommended_parallelism,
                        ),
                        recommended_parallelism: inner.budget.recommended_parallelism,
                        commit_ratio: inner.snapshot.commit_ratio,
                    };
                }

                let granted = requested_tokens.min(inner.available_tokens);
                if granted > 0 || requested_tokens == 0 {
                    let now = Instant::now();
                    let lease = Lease {
                        id: self.fresh_lease_id(&inner),
                        tool: tool.to_string(),
                        tokens: granted,
                        acquired_at: now,
                        expires_at: now + self.config.lease_ttl,
                        commit_ratio_at_acquire: inner.snapshot.commit_ratio,
                        warning_logged: false,
                    };
                    let grant = LeaseGrant {
                        lease_id: lease.id.clone(),
                        granted_tokens: granted,
                        recommended_parallelism: inner.budget.recommended_parallelism,
                        commit_ratio: inner.snapshot.commit_ratio,
                    };
                    inner.available_tokens -= granted;
                    debug!(
                        lease_id = %lease.id,
                        tool,
                        tokens = granted,
                        requested = requested_tokens,
                        available = inner.available_tokens,
                        "lease granted"
                    );
                    inner.leases.insert(lease.id.clone(), lease);
                    return AcquireOutcome::Granted(grant);
                }

                (
                    self.config.retry_delay(inner.budget.throttle_level),
                    inner.budget.recommended_parallelism,
                    inner.snapshot.commit_ratio,
                )
            };

            let now = Instant::now();
            if now >= deadline {
                return AcquireOutcome::Denied {
                    reason: "timeout waiting for tokens".to_string(),
                    recommended_parallelism: parallelism,
                    commit_ratio: ratio,
                };
            }
            // The lock is not held across this suspension point.
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }

    /// Returns a lease's tokens and classifies the finished invocation.
    ///
    /// An unknown id (never granted, already released, or reclaimed by the
    /// sweep) is acknowledged `false` with no side effects.
    #[must_use]
    pub fn release(&self, lease_id: &str, report: &ReleaseReport) -> ReleaseOutcome {
        let mut inner = self.lock();
        let Some(lease) = inner.leases.remove(lease_id) else {
            debug!(lease_id, "release for unknown lease");
            return ReleaseOutcome::unknown();
        };

        inner.available_tokens = (inner.available_tokens + lease.tokens).min(inner.total_tokens);
        self.refresh(&mut inner);

        let input = ClassifyInput {
            tool: lease.tool.clone(),
            exit_code: report.exit_code,
            duration_ms: report.duration_ms,
            commit_ratio_at_exit: inner.snapshot.commit_ratio,
            peak_commit_ratio: lease
                .commit_ratio_at_acquire
                .max(inner.snapshot.commit_ratio),
            peak_process_commit_bytes: report.peak_commit_bytes,
            stderr_had_diagnostics: report.stderr_had_diagnostics,
            commit_charge_bytes: inner.snapshot.commit_charge,
            commit_limit_bytes: inner.snapshot.commit_limit,
            recommended_parallelism: inner.budget.recommended_parallelism,
        };
        let result = classify(&input, &self.classifier);

        debug!(
            lease_id,
            tool = %lease.tool,
            tokens = lease.tokens,
            exit_code = report.exit_code,
            classification = %result.classification,
            "lease released"
        );

        let retry_with_tokens = result
            .should_retry
            .then(|| (lease.tokens / 2).max(1));
        ReleaseOutcome {
            acknowledged: true,
            classification: result.classification,
            message: result.message,
            should_retry: result.should_retry,
            retry_with_tokens,
        }
    }

    /// Whether the lease is still in the table and inside its TTL.
    ///
    /// Does not extend the TTL; expiry is absolute.
    #[must_use]
    pub fn heartbeat(&self, lease_id: &str) -> bool {
        let inner = self.lock();
        inner
            .leases
            .get(lease_id)
            .is_some_and(|lease| Instant::now() < lease.expires_at)
    }

    /// Consistent snapshot of totals, pressure, and recent leases.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let inner = self.lock();
        let now = Instant::now();

        let mut recent: Vec<&Lease> = inner.leases.values().collect();
        recent.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at));
        let recent_leases = recent
            .into_iter()
            .take(STATUS_RECENT_LEASES)
            .map(|lease| LeaseInfo {
                lease_id: lease.id.clone(),
                tool: lease.tool.clone(),
                tokens: lease.tokens,
                running_for: now.saturating_duration_since(lease.acquired_at),
                expires_in: lease.expires_at.saturating_duration_since(now),
            })
            .collect();

        PoolStatus {
            total_tokens: inner.total_tokens,
            available_tokens: inner.available_tokens,
            active_leases: inner.leases.len() as u32,
            expired_leases: inner.expired_leases,
            snapshot: inner.snapshot,
            throttle_level: inner.budget.throttle_level,
            recommended_parallelism: inner.budget.recommended_parallelism,
            recent_leases,
        }
    }

    /// One maintenance tick: refresh the budget, warn about long-running
    /// leases, reclaim expired ones.
    ///
    /// Driven every [`PoolConfig::sweep_interval`] by the daemon,
    /// decoupled from request traffic.
    pub fn sweep(&self) {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        let now = Instant::now();
        let warning_age = self.config.long_running_warning;
        let mut expired: Vec<String> = Vec::new();
        for lease in inner.leases.values_mut() {
            if now >= lease.expires_at {
                expired.push(lease.id.clone());
            } else if !lease.warning_logged && now >= lease.acquired_at + warning_age {
                warn!(
                    lease_id = %lease.id,
                    tool = %lease.tool,
                    elapsed_secs = now.duration_since(lease.acquired_at).as_secs(),
                    "lease has been running unusually long"
                );
                lease.warning_logged = true;
            }
        }

        for id in expired {
            if let Some(lease) = inner.leases.remove(&id) {
                inner.available_tokens =
                    (inner.available_tokens + lease.tokens).min(inner.total_tokens);
                inner.expired_leases += 1;
                warn!(
                    lease_id = %id,
                    tool = %lease.tool,
                    tokens = lease.tokens,
                    "lease TTL expired; tokens reclaimed"
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // The pool holds no invariant that a panicking holder could have
        // half-applied in a way worth dying for; recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refreshes the snapshot, recomputes the budget, and reconciles the
    /// available count. Probe failures degrade to the worst-case snapshot
    /// and are logged once per transition.
    fn refresh(&self, inner: &mut PoolInner) {
        let snapshot = match self.probe.sample() {
            Ok(snapshot) => {
                if inner.probe_failed {
                    info!("memory probe recovered");
                    inner.probe_failed = false;
                }
                snapshot
            }
            Err(err) => {
                if !inner.probe_failed {
                    warn!(%err, "memory probe unavailable; assuming worst-case pressure");
                    inner.probe_failed = true;
                }
                MemorySnapshot::worst_case()
            }
        };

        let new_budget = budget::compute(&snapshot, &self.config.budget);
        let in_use = inner.total_tokens - inner.available_tokens;
        let stranded = new_budget.total_tokens < in_use;
        if stranded && !inner.budget_stranded {
            warn!(
                in_use,
                new_total = new_budget.total_tokens,
                commit_ratio = snapshot.commit_ratio,
                "budget shrank below outstanding leases; new admissions \
                 throttled until tokens are released"
            );
        }
        inner.budget_stranded = stranded;
        inner.available_tokens = new_budget.total_tokens.saturating_sub(in_use);
        inner.total_tokens = new_budget.total_tokens;
        inner.snapshot = snapshot;
        inner.budget = new_budget;
    }

    /// Generates a lease id not currently in the table.
    ///
    /// Ids are 12 hex chars of a v4 uuid; the loop guards the negligible
    /// collision case so an id never refers to two leases.
    fn fresh_lease_id(&self, inner: &PoolInner) -> String {
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
            if !inner.leases.contains_key(&id) {
                return id;
            }
        }
    }
}
