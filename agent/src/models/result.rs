//! Upgrade result models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::{RiskLevel, VersionAction};

/// Status of a recorded step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Warning,
}

/// One step of the upgrade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeStep {
    pub step: String,
    pub status: StepStatus,
    pub message: String,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// Kind of rollback that was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    /// Previous software set reinstated and rebooted
    Package,
    /// Only the last committed configuration was reverted
    Configuration,
    /// Package rollback staged but the reboot request failed
    PackageStaged,
}

/// Software the device is believed to run when the run ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftwareState {
    Previous,
    Target,
    Unknown,
}

impl SoftwareState {
    pub fn describe(&self) -> &'static str {
        match self {
            SoftwareState::Previous => "device believed to be on the previous (old) software",
            SoftwareState::Target => "device believed to be on the new (target) software",
            SoftwareState::Unknown => "device software state unknown (old or new)",
        }
    }
}

/// Outcome of the install, reboot and verify cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeResult {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub initial_version: Option<String>,
    pub final_version: Option<String>,
    pub version_action: VersionAction,
    pub risk: RiskLevel,
    pub install_status: Option<String>,
    pub reboot_required: bool,
    pub reboot_performed: bool,
    pub reboot_wait_secs: f64,
    pub rollback_performed: bool,
    pub rollback_reason: Option<String>,
    pub rollback_kind: Option<RollbackKind>,
    pub software_state: SoftwareState,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub steps: Vec<UpgradeStep>,
}

impl Default for UpgradeResult {
    fn default() -> Self {
        Self {
            success: false,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: 0.0,
            initial_version: None,
            final_version: None,
            version_action: VersionAction::Unknown,
            risk: RiskLevel::Unknown,
            install_status: None,
            reboot_required: false,
            reboot_performed: false,
            reboot_wait_secs: 0.0,
            rollback_performed: false,
            rollback_reason: None,
            rollback_kind: None,
            software_state: SoftwareState::Previous,
            warnings: Vec::new(),
            errors: Vec::new(),
            steps: Vec::new(),
        }
    }
}

impl UpgradeResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(&mut self, step: &str, status: StepStatus, message: impl Into<String>, duration: Duration) {
        self.steps.push(UpgradeStep {
            step: step.to_string(),
            status,
            message: message.into(),
            duration_secs: duration.as_secs_f64(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Stamp the end time; later calls keep the first stamp
    pub fn finalize(&mut self, success: bool) {
        if self.end_time.is_some() {
            return;
        }
        let end = Utc::now();
        self.success = success;
        self.duration_secs = (end - self.start_time).num_milliseconds() as f64 / 1000.0;
        self.end_time = Some(end);
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }
}
