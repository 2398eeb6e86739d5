//! Per-device run state

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::UpgradeError;
use crate::models::precheck::PreCheckSummary;
use crate::models::result::UpgradeResult;
use crate::upgrade::phase::{PhaseEvent, PhaseMachine, UpgradePhase};
use crate::version::{RiskLevel, VersionAction};

/// Terminal error of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub message: String,
    pub kind: String,
}

/// Health figures captured before the upgrade, compared after it
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceBaseline {
    pub interface_count: Option<usize>,
}

/// Configuration backup record
#[derive(Debug, Clone, Serialize)]
pub struct ConfigBackup {
    pub rescue_saved: bool,
    pub message: String,
    pub captured_at: DateTime<Utc>,
}

/// Mutable state of one device upgrade, owned by a single run
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub job_id: String,
    pub hostname: String,
    pub target_version: String,
    pub image_filename: String,
    phase: UpgradePhase,
    pub phase_message: String,
    pub current_version: Option<String>,
    pub final_version: Option<String>,
    pub version_action: VersionAction,
    pub risk: RiskLevel,
    pub warnings: Vec<String>,
    pub error: Option<RunError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub baseline: DeviceBaseline,
    pub config_backup: Option<ConfigBackup>,
    pub pre_check_summary: Option<PreCheckSummary>,
    pub upgrade_result: Option<UpgradeResult>,
    #[serde(skip)]
    machine: PhaseMachine,
}

impl DeviceStatus {
    pub fn new(job_id: &str, hostname: &str, target_version: &str, image_filename: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            hostname: hostname.to_string(),
            target_version: target_version.to_string(),
            image_filename: image_filename.to_string(),
            phase: UpgradePhase::Pending,
            phase_message: "Waiting to start".to_string(),
            current_version: None,
            final_version: None,
            version_action: VersionAction::Unknown,
            risk: RiskLevel::Unknown,
            warnings: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
            baseline: DeviceBaseline::default(),
            config_backup: None,
            pre_check_summary: None,
            upgrade_result: None,
            machine: PhaseMachine::new(),
        }
    }

    pub fn phase(&self) -> UpgradePhase {
        self.phase
    }

    /// Phases entered so far
    pub fn phase_history(&self) -> &[UpgradePhase] {
        self.machine.history()
    }

    /// Apply a phase event; rejects transitions the lifecycle does not allow
    pub fn update_phase(
        &mut self,
        event: PhaseEvent,
        message: impl Into<String>,
    ) -> Result<UpgradePhase, UpgradeError> {
        let phase = self.machine.process(event).map_err(UpgradeError::Internal)?;
        self.phase = phase;
        self.phase_message = message.into();
        if phase == UpgradePhase::PreCheck && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if phase.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(phase)
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn set_error(&mut self, message: impl Into<String>, kind: &str) {
        self.error = Some(RunError {
            message: message.into(),
            kind: kind.to_string(),
        });
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_phase_tracks_times() {
        let mut status = DeviceStatus::new("job-1", "r1", "21.4R3", "img.tgz");
        assert_eq!(status.phase(), UpgradePhase::Pending);
        status.update_phase(PhaseEvent::Start, "checking").unwrap();
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_none());
        status
            .update_phase(PhaseEvent::Fail("boom".into()), "failed")
            .unwrap();
        assert!(status.is_finished());
        assert!(status.finished_at.is_some());
        assert_eq!(status.phase_message, "failed");
    }

    #[test]
    fn test_invalid_transition_is_error() {
        let mut status = DeviceStatus::new("job-1", "r1", "21.4R3", "img.tgz");
        let err = status.update_phase(PhaseEvent::Installed, "x").unwrap_err();
        assert_eq!(err.kind(), "InternalError");
        assert_eq!(status.phase(), UpgradePhase::Pending);
    }

    #[test]
    fn test_status_serializes_phase() {
        let status = DeviceStatus::new("job-1", "r1", "21.4R3", "img.tgz");
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "pending");
        assert_eq!(value["hostname"], "r1");
        assert!(value.get("machine").is_none());
    }
}
