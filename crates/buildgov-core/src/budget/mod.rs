//! Token budget engine: turns a memory snapshot into an integer token
//! capacity and a discrete throttle level.
//!
//! [`compute`] is a pure function of `(snapshot, config)` with no clock
//! and no side effects, so the pool can recompute the budget on every
//! request and every maintenance tick without coordination beyond its own
//! lock.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::MemorySnapshot;

/// Commit headroom one token represents, in GiB.
pub const DEFAULT_GB_PER_TOKEN: f64 = 2.0;
/// Commit headroom never offered as tokens, in GiB.
pub const DEFAULT_SAFETY_RESERVE_GB: f64 = 8.0;
/// Lower clamp on the token capacity.
pub const DEFAULT_MIN_TOKENS: u32 = 1;
/// Upper clamp on the token capacity.
pub const DEFAULT_MAX_TOKENS: u32 = 32;
/// Commit ratio at which admission enters the caution band.
pub const DEFAULT_CAUTION_RATIO: f64 = 0.80;
/// Commit ratio at which admission enters the soft-stop band.
pub const DEFAULT_SOFT_STOP_RATIO: f64 = 0.88;
/// Commit ratio at which admission refuses outright.
pub const DEFAULT_HARD_STOP_RATIO: f64 = 0.92;

/// Headroom assumed per parallel build job when recommending a `-j` value,
/// in GiB.
const GB_PER_PARALLEL_JOB: f64 = 3.0;

/// Configuration knobs for the token budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBudgetConfig {
    /// Committed-memory headroom that one token represents, in GiB.
    pub gb_per_token: f64,
    /// Commit headroom never offered as tokens, in GiB.
    pub safety_reserve_gb: f64,
    /// Lower clamp on `total_tokens`.
    pub min_tokens: u32,
    /// Upper clamp on `total_tokens`.
    pub max_tokens: u32,
    /// Commit-ratio threshold for the caution band.
    pub caution_ratio: f64,
    /// Commit-ratio threshold for the soft-stop band.
    pub soft_stop_ratio: f64,
    /// Commit-ratio threshold for the hard-stop band.
    pub hard_stop_ratio: f64,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            gb_per_token: DEFAULT_GB_PER_TOKEN,
            safety_reserve_gb: DEFAULT_SAFETY_RESERVE_GB,
            min_tokens: DEFAULT_MIN_TOKENS,
            max_tokens: DEFAULT_MAX_TOKENS,
            caution_ratio: DEFAULT_CAUTION_RATIO,
            soft_stop_ratio: DEFAULT_SOFT_STOP_RATIO,
            hard_stop_ratio: DEFAULT_HARD_STOP_RATIO,
        }
    }
}

impl TokenBudgetConfig {
    /// Validates the configuration.
    ///
    /// The throttle thresholds must be strictly increasing and inside
    /// `(0, 1)`, the token clamps ordered with `min_tokens >= 1`, and
    /// `gb_per_token` positive. Detected at startup; fatal to the governor.
    pub fn validate(&self) -> Result<(), BudgetConfigError> {
        if self.gb_per_token <= 0.0 {
            return Err(BudgetConfigError::NonPositive {
                field: "gb_per_token",
                value: self.gb_per_token,
            });
        }
        if self.safety_reserve_gb < 0.0 {
            return Err(BudgetConfigError::NonPositive {
                field: "safety_reserve_gb",
                value: self.safety_reserve_gb,
            });
        }
        if self.min_tokens == 0 || self.min_tokens > self.max_tokens {
            return Err(BudgetConfigError::TokenBounds {
                min: self.min_tokens,
                max: self.max_tokens,
            });
        }
        for (field, value) in [
            ("caution_ratio", self.caution_ratio),
            ("soft_stop_ratio", self.soft_stop_ratio),
            ("hard_stop_ratio", self.hard_stop_ratio),
        ] {
            if !(0.0..1.0).contains(&value) || value == 0.0 {
                return Err(BudgetConfigError::RatioRange { field, value });
            }
        }
        if !(self.caution_ratio < self.soft_stop_ratio
            && self.soft_stop_ratio < self.hard_stop_ratio)
        {
            return Err(BudgetConfigError::ThresholdOrder {
                caution: self.caution_ratio,
                soft_stop: self.soft_stop_ratio,
                hard_stop: self.hard_stop_ratio,
            });
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BudgetConfigError {
    /// Throttle thresholds are not strictly increasing.
    #[error(
        "throttle thresholds must satisfy caution < soft_stop < hard_stop, \
         got {caution} / {soft_stop} / {hard_stop}"
    )]
    ThresholdOrder {
        /// Configured caution threshold.
        caution: f64,
        /// Configured soft-stop threshold.
        soft_stop: f64,
        /// Configured hard-stop threshold.
        hard_stop: f64,
    },

    /// A field that must be positive is zero or negative.
    #[error("{field} must be positive, got {value}")]
    NonPositive {
        /// The offending field.
        field: &'static str,
        /// The configured value.
        value: f64,
    },

    /// Token clamps are out of order or zero.
    #[error("token bounds must satisfy 1 <= min <= max, got min={min} max={max}")]
    TokenBounds {
        /// Configured minimum.
        min: u32,
        /// Configured maximum.
        max: u32,
    },

    /// A ratio threshold is outside `(0, 1)`.
    #[error("{field} must be in (0, 1), got {value}")]
    RatioRange {
        /// The offending field.
        field: &'static str,
        /// The configured value.
        value: f64,
    },
}

/// Discrete throttle state derived from the commit ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThrottleLevel {
    /// Commit ratio below the caution threshold.
    Normal,
    /// At or above the caution threshold: acquire retries back off.
    Caution,
    /// At or above the soft-stop threshold: retries back off hard.
    SoftStop,
    /// At or above the hard-stop threshold: acquires are refused.
    HardStop,
}

impl std::fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "Normal",
            Self::Caution => "Caution",
            Self::SoftStop => "SoftStop",
            Self::HardStop => "HardStop",
        };
        f.write_str(s)
    }
}

/// A token budget derived from one `(snapshot, config)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenBudget {
    /// Token capacity, clamped to `[min_tokens, max_tokens]`.
    pub total_tokens: u32,
    /// Throttle band for the snapshot's commit ratio.
    pub throttle_level: ThrottleLevel,
    /// Suggested build-driver parallelism for the current headroom.
    pub recommended_parallelism: u32,
    /// Commit headroom remaining before the limit, in GiB.
    pub available_commit_gb: f64,
}

/// Computes the token budget for a snapshot under the given configuration.
///
/// Pure and deterministic: identical inputs yield identical outputs across
/// arbitrary call orders.
#[must_use]
pub fn compute(snapshot: &MemorySnapshot, config: &TokenBudgetConfig) -> TokenBudget {
    let available_commit_gb = snapshot.available_commit_gb();
    let usable = (available_commit_gb - config.safety_reserve_gb).max(0.0);

    let raw_tokens = (usable / config.gb_per_token).floor() as u32;
    let total_tokens = raw_tokens.clamp(config.min_tokens, config.max_tokens);

    let throttle_level = if snapshot.commit_ratio >= config.hard_stop_ratio {
        ThrottleLevel::HardStop
    } else if snapshot.commit_ratio >= config.soft_stop_ratio {
        ThrottleLevel::SoftStop
    } else if snapshot.commit_ratio >= config.caution_ratio {
        ThrottleLevel::Caution
    } else {
        ThrottleLevel::Normal
    };

    let recommended_parallelism = ((usable / GB_PER_PARALLEL_JOB).floor() as u32).max(1);

    TokenBudget {
        total_tokens,
        throttle_level,
        recommended_parallelism,
        available_commit_gb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BYTES_PER_GIB;

    fn snapshot_with_ratio(limit_gb: u64, ratio: f64) -> MemorySnapshot {
        let limit = limit_gb * BYTES_PER_GIB;
        // Round, don't truncate: truncation can land the derived ratio a
        // hair below the threshold under test.
        let charge = (limit as f64 * ratio).round() as u64;
        MemorySnapshot::new(limit, limit / 2, charge, limit)
    }

    #[test]
    fn compute_basic_capacity() {
        // 48 GiB limit, 20 GiB charged: 28 GiB headroom, minus the 8 GiB
        // reserve leaves 20 usable, at 2 GiB per token.
        let snap = snapshot_with_ratio(48, 20.0 / 48.0);
        let budget = compute(&snap, &TokenBudgetConfig::default());
        assert_eq!(budget.total_tokens, 10);
        assert_eq!(budget.throttle_level, ThrottleLevel::Normal);
        assert_eq!(budget.recommended_parallelism, 6);
    }

    #[test]
    fn compute_clamps_to_min_tokens() {
        let snap = snapshot_with_ratio(48, 0.99);
        let budget = compute(&snap, &TokenBudgetConfig::default());
        assert_eq!(budget.total_tokens, DEFAULT_MIN_TOKENS);
        assert_eq!(budget.recommended_parallelism, 1);
    }

    #[test]
    fn compute_clamps_to_max_tokens() {
        let snap = snapshot_with_ratio(512, 0.01);
        let budget = compute(&snap, &TokenBudgetConfig::default());
        assert_eq!(budget.total_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn throttle_bands_follow_thresholds() {
        let config = TokenBudgetConfig::default();
        let cases = [
            (0.50, ThrottleLevel::Normal),
            (0.80, ThrottleLevel::Caution),
            (0.87, ThrottleLevel::Caution),
            (0.88, ThrottleLevel::SoftStop),
            (0.91, ThrottleLevel::SoftStop),
            (0.92, ThrottleLevel::HardStop),
            (0.99, ThrottleLevel::HardStop),
        ];
        for (ratio, expected) in cases {
            let snap = snapshot_with_ratio(48, ratio);
            assert_eq!(
                compute(&snap, &config).throttle_level,
                expected,
                "ratio {ratio}"
            );
        }
    }

    #[test]
    fn worst_case_snapshot_hard_stops() {
        let budget = compute(&MemorySnapshot::worst_case(), &TokenBudgetConfig::default());
        assert_eq!(budget.throttle_level, ThrottleLevel::HardStop);
        assert_eq!(budget.total_tokens, DEFAULT_MIN_TOKENS);
    }

    #[test]
    fn default_config_validates() {
        TokenBudgetConfig::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_misordered_thresholds() {
        let config = TokenBudgetConfig {
            caution_ratio: 0.90,
            soft_stop_ratio: 0.88,
            ..TokenBudgetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BudgetConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn validate_rejects_equal_thresholds() {
        let config = TokenBudgetConfig {
            soft_stop_ratio: 0.92,
            ..TokenBudgetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_min_tokens() {
        let config = TokenBudgetConfig {
            min_tokens: 0,
            ..TokenBudgetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BudgetConfigError::TokenBounds { .. })
        ));
    }

    #[test]
    fn validate_rejects_inverted_token_bounds() {
        let config = TokenBudgetConfig {
            min_tokens: 8,
            max_tokens: 4,
            ..TokenBudgetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_positive_gb_per_token() {
        let config = TokenBudgetConfig {
            gb_per_token: 0.0,
            ..TokenBudgetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BudgetConfigError::NonPositive { .. })
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_ratio() {
        let config = TokenBudgetConfig {
            hard_stop_ratio: 1.0,
            ..TokenBudgetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BudgetConfigError::RatioRange { .. })
        ));
    }
}
