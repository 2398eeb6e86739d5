//! Shared helpers: build info, backoff, ids

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Build metadata printed by `--version`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Exponential backoff shape
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl CooldownOptions {
    /// Doubling backoff from `base_delay`, capped at `max_delay`
    pub fn doubling(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }
}

/// Delay before retry number `attempt` (zero-based)
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(exponent);
    if !delay_secs.is_finite() {
        return options.max_delay;
    }
    Duration::from_secs_f64(delay_secs.min(options.max_delay.as_secs_f64()))
}

/// Random UUID v4, used for job and client ids
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
