//! Pre-upgrade check battery
//!
//! Checks run in a fixed order against an open session. A check that errors
//! or panics is recorded as a critical failure naming the check; the rest of
//! the battery still runs.

pub mod checks;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::device::connector::DeviceHandle;
use crate::errors::DeviceError;
use crate::models::precheck::{PreCheckResult, PreCheckSummary};

/// Pre-check thresholds
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub storage_warning_percent: f64,
    pub storage_critical_percent: f64,
    pub min_storage_mb: f64,
    /// Free space wanted per byte of image
    pub image_space_multiplier: f64,
    /// Images below this size are treated as truncated uploads
    pub min_image_bytes: u64,
    pub temperature_warning_c: f64,
    pub temperature_critical_c: f64,
    pub min_power_supplies: usize,
    pub min_fans: usize,
    pub max_active_sessions: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            storage_warning_percent: 85.0,
            storage_critical_percent: 95.0,
            min_storage_mb: 500.0,
            image_space_multiplier: 2.2,
            min_image_bytes: 1024 * 1024,
            temperature_warning_c: 70.0,
            temperature_critical_c: 85.0,
            min_power_supplies: 1,
            min_fans: 1,
            max_active_sessions: 3,
        }
    }
}

/// What the checks know about the planned upgrade
#[derive(Debug, Clone)]
pub struct CheckEnv {
    pub hostname: String,
    pub image_filename: String,
    /// Staging directory on the device
    pub image_dir: String,
    pub current_version: String,
    pub target_version: String,
    pub thresholds: Thresholds,
}

impl CheckEnv {
    pub fn image_path(&self) -> String {
        format!("{}/{}", self.image_dir.trim_end_matches('/'), self.image_filename)
    }
}

/// One independent health check
#[async_trait]
pub trait PreCheck: Send + Sync {
    /// Stable id, also used as the result name
    fn id(&self) -> &'static str;

    async fn run(&self, device: &mut DeviceHandle, env: &CheckEnv) -> Result<PreCheckResult, DeviceError>;
}

/// Told about every result as soon as it exists
#[async_trait]
pub trait CheckObserver: Send + Sync {
    async fn on_result(&self, result: &PreCheckResult, index: usize, total: usize);
}

/// Ordered battery of checks
pub struct PreCheckEngine {
    checks: Vec<Box<dyn PreCheck>>,
    observer: Option<Arc<dyn CheckObserver>>,
}

impl PreCheckEngine {
    pub fn new(checks: Vec<Box<dyn PreCheck>>) -> Self {
        Self { checks, observer: None }
    }

    /// The full battery in its fixed order
    pub fn standard() -> Self {
        Self::new(checks::standard())
    }

    /// Keep only the named checks, preserving battery order
    pub fn select(mut self, ids: &[String]) -> Self {
        for id in ids {
            if !self.checks.iter().any(|c| c.id() == id) {
                warn!("Ignoring unknown pre-check id: {}", id);
            }
        }
        self.checks.retain(|c| ids.iter().any(|id| id == c.id()));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CheckObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn check_ids(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.id()).collect()
    }

    /// Run every check in order and aggregate the results
    pub async fn run_all(&self, device: &mut DeviceHandle, env: &CheckEnv) -> PreCheckSummary {
        let total = self.checks.len();
        let mut results = Vec::with_capacity(total);
        info!("[{}] Running {} pre-upgrade checks", env.hostname, total);

        for (index, check) in self.checks.iter().enumerate() {
            debug!("[{}] Executing check {}", env.hostname, check.id());
            let outcome = AssertUnwindSafe(check.run(device, env)).catch_unwind().await;

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!("[{}] Check {} failed: {}", env.hostname, check.id(), e);
                    execution_failure(check.id(), &e.to_string())
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "check panicked".to_string());
                    error!("[{}] Check {} panicked: {}", env.hostname, check.id(), reason);
                    execution_failure(check.id(), &reason)
                }
            };

            info!(
                "[{}] {} {}: {:?} - {}",
                env.hostname,
                if result.passed { "ok" } else { "!!" },
                result.check_name,
                result.severity,
                result.message
            );

            if let Some(observer) = &self.observer {
                observer.on_result(&result, index, total).await;
            }
            results.push(result);
        }

        let summary = PreCheckSummary::new(results);
        info!(
            "[{}] Pre-check summary: {}/{} passed, {} warnings, {} critical failures",
            env.hostname,
            summary.passed(),
            summary.total(),
            summary.warnings(),
            summary.critical_failures()
        );
        summary
    }
}

fn execution_failure(id: &str, reason: &str) -> PreCheckResult {
    PreCheckResult::critical(id, format!("Check execution failed: {}", reason))
        .with_details(json!({ "error": reason }))
        .with_recommendation("Investigate device connectivity or permissions")
}
