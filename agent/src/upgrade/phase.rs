//! Finite state machine for the per-device upgrade lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

/// Upgrade phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    /// Initial state, nothing done yet
    Pending,

    /// Connecting and running pre-upgrade checks
    PreCheck,

    /// Saving a rescue configuration
    Backup,

    /// Confirming reachability before mutation
    Connecting,

    /// Validating the version transition
    Validating,

    /// Installing the software package
    Installing,

    /// Waiting for the device to come back
    Rebooting,

    /// Verifying the final version and functional health
    Verifying,

    /// Finished successfully
    Completed,

    /// Finished with a failure
    Failed,

    /// Finished after a rollback
    RolledBack,
}

impl UpgradePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradePhase::Completed | UpgradePhase::Failed | UpgradePhase::RolledBack
        )
    }

    /// Position in the forward order; terminals share the last slot
    pub fn ordinal(&self) -> u8 {
        match self {
            UpgradePhase::Pending => 0,
            UpgradePhase::PreCheck => 1,
            UpgradePhase::Backup => 2,
            UpgradePhase::Connecting => 3,
            UpgradePhase::Validating => 4,
            UpgradePhase::Installing => 5,
            UpgradePhase::Rebooting => 6,
            UpgradePhase::Verifying => 7,
            UpgradePhase::Completed | UpgradePhase::Failed | UpgradePhase::RolledBack => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradePhase::Pending => "pending",
            UpgradePhase::PreCheck => "pre_check",
            UpgradePhase::Backup => "backup",
            UpgradePhase::Connecting => "connecting",
            UpgradePhase::Validating => "validating",
            UpgradePhase::Installing => "installing",
            UpgradePhase::Rebooting => "rebooting",
            UpgradePhase::Verifying => "verifying",
            UpgradePhase::Completed => "completed",
            UpgradePhase::Failed => "failed",
            UpgradePhase::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase event
#[derive(Debug, Clone)]
pub enum PhaseEvent {
    /// Begin the run
    Start,

    /// Pre-checks allow installation
    ChecksPassed,

    /// Pre-check only run finished
    ChecksReported,

    /// Backup step finished (successfully or with a warning)
    BackupDone,

    /// Device confirmed reachable
    Connected,

    /// Version transition accepted
    Validated,

    /// Device already runs the target version
    AlreadyOnTarget,

    /// Package installed; reboot under way
    Installed,

    /// Device recovered from the reboot
    Recovered,

    /// Final verification done
    Verified,

    /// Terminal failure
    Fail(String),

    /// Rollback path finished
    RolledBack(String),
}

/// Upgrade phase FSM
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: UpgradePhase,
    error: Option<String>,
    history: Vec<UpgradePhase>,
}

impl PhaseMachine {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            phase: UpgradePhase::Pending,
            error: None,
            history: vec![UpgradePhase::Pending],
        }
    }

    /// Get current phase
    pub fn phase(&self) -> UpgradePhase {
        self.phase
    }

    /// Get terminal error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every phase entered so far, in order
    pub fn history(&self) -> &[UpgradePhase] {
        &self.history
    }

    /// Process an event and transition phase
    pub fn process(&mut self, event: PhaseEvent) -> Result<UpgradePhase, String> {
        use UpgradePhase::*;

        let next = match (self.phase, &event) {
            (Pending, PhaseEvent::Start) => PreCheck,
            (PreCheck, PhaseEvent::ChecksPassed) => Backup,
            (PreCheck, PhaseEvent::ChecksReported) => Completed,
            (Backup, PhaseEvent::BackupDone) => Connecting,
            (Connecting, PhaseEvent::Connected) => Validating,
            (Validating, PhaseEvent::Validated) => Installing,
            (Validating, PhaseEvent::AlreadyOnTarget) => Completed,
            (Installing, PhaseEvent::Installed) => Rebooting,
            (Rebooting, PhaseEvent::Recovered) => Verifying,
            (Verifying, PhaseEvent::Verified) => Completed,

            // Terminal transitions from any in-progress phase
            (phase, PhaseEvent::Fail(err)) if !phase.is_terminal() => {
                self.error = Some(err.clone());
                Failed
            }
            (phase, PhaseEvent::RolledBack(reason)) if !phase.is_terminal() && phase != Pending => {
                self.error = Some(reason.clone());
                RolledBack
            }

            // Invalid transitions
            (phase, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", phase, event));
            }
        };

        self.phase = next;
        self.history.push(next);
        Ok(next)
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
