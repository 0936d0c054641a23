//! Daemon startup configuration.
//!
//! The budget knobs are read from the environment so operators can tune a
//! host without a config file; the governor persists nothing, so there is
//! nothing else to configure. Invalid values are fatal at startup: a
//! governor admitting work under a misread budget is worse than no
//! governor.

use buildgov_core::budget::{BudgetConfigError, TokenBudgetConfig};
use thiserror::Error;

/// Environment override for [`TokenBudgetConfig::gb_per_token`].
pub const GB_PER_TOKEN_ENV: &str = "GOV_GB_PER_TOKEN";
/// Environment override for [`TokenBudgetConfig::safety_reserve_gb`].
pub const SAFETY_RESERVE_ENV: &str = "GOV_SAFETY_RESERVE_GB";
/// Environment override for [`TokenBudgetConfig::min_tokens`].
pub const MIN_TOKENS_ENV: &str = "GOV_MIN_TOKENS";
/// Environment override for [`TokenBudgetConfig::max_tokens`].
pub const MAX_TOKENS_ENV: &str = "GOV_MAX_TOKENS";
/// Environment override for [`TokenBudgetConfig::caution_ratio`].
pub const CAUTION_RATIO_ENV: &str = "GOV_CAUTION_RATIO";
/// Environment override for [`TokenBudgetConfig::soft_stop_ratio`].
pub const SOFT_STOP_RATIO_ENV: &str = "GOV_SOFT_STOP_RATIO";
/// Environment override for [`TokenBudgetConfig::hard_stop_ratio`].
pub const HARD_STOP_RATIO_ENV: &str = "GOV_HARD_STOP_RATIO";

/// Startup configuration errors. All fatal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An override variable is set but does not parse.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// The environment variable.
        var: &'static str,
        /// Its unparsable contents.
        value: String,
    },

    /// The assembled budget config fails validation.
    #[error(transparent)]
    InvalidBudget(#[from] BudgetConfigError),
}

/// Builds the budget configuration from defaults plus environment
/// overrides, then validates it.
pub fn budget_from_env() -> Result<TokenBudgetConfig, ConfigError> {
    let mut config = TokenBudgetConfig::default();

    if let Some(v) = parse_env::<f64>(GB_PER_TOKEN_ENV)? {
        config.gb_per_token = v;
    }
    if let Some(v) = parse_env::<f64>(SAFETY_RESERVE_ENV)? {
        config.safety_reserve_gb = v;
    }
    if let Some(v) = parse_env::<u32>(MIN_TOKENS_ENV)? {
        config.min_tokens = v;
    }
    if let Some(v) = parse_env::<u32>(MAX_TOKENS_ENV)? {
        config.max_tokens = v;
    }
    if let Some(v) = parse_env::<f64>(CAUTION_RATIO_ENV)? {
        config.caution_ratio = v;
    }
    if let Some(v) = parse_env::<f64>(SOFT_STOP_RATIO_ENV)? {
        config.soft_stop_ratio = v;
    }
    if let Some(v) = parse_env::<f64>(HARD_STOP_RATIO_ENV)? {
        config.hard_stop_ratio = v;
    }

    config.validate()?;
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(None),
    }
}
