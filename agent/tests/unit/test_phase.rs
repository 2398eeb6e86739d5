//! Phase lifecycle unit tests

use tokio_test::{assert_err, assert_ok};
use upgrade_agent::models::status::DeviceStatus;
use upgrade_agent::upgrade::phase::{PhaseEvent, PhaseMachine, UpgradePhase};

#[test]
fn test_phase_initial_state() {
    let fsm = PhaseMachine::new();
    assert_eq!(fsm.phase(), UpgradePhase::Pending);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history(), &[UpgradePhase::Pending]);
}

#[test]
fn test_pre_check_only_flow() {
    let mut fsm = PhaseMachine::new();

    // Pending -> PreCheck
    assert_eq!(assert_ok!(fsm.process(PhaseEvent::Start)), UpgradePhase::PreCheck);

    // PreCheck -> Completed
    assert_eq!(assert_ok!(fsm.process(PhaseEvent::ChecksReported)), UpgradePhase::Completed);
    assert!(fsm.phase().is_terminal());
}

#[test]
fn test_already_on_target_flow() {
    let mut fsm = PhaseMachine::new();
    for event in [
        PhaseEvent::Start,
        PhaseEvent::ChecksPassed,
        PhaseEvent::BackupDone,
        PhaseEvent::Connected,
        PhaseEvent::AlreadyOnTarget,
    ] {
        fsm.process(event).unwrap();
    }
    assert_eq!(fsm.phase(), UpgradePhase::Completed);
    assert!(!fsm.history().contains(&UpgradePhase::Installing));
}

#[test]
fn test_failure_records_error() {
    let mut fsm = PhaseMachine::new();

    fsm.process(PhaseEvent::Start).unwrap();
    fsm.process(PhaseEvent::Fail("image missing".to_string())).unwrap();

    assert_eq!(fsm.phase(), UpgradePhase::Failed);
    assert_eq!(fsm.error(), Some("image missing"));
}

#[test]
fn test_rolled_back_needs_a_started_run() {
    let mut fsm = PhaseMachine::new();
    assert!(fsm.process(PhaseEvent::RolledBack("early".to_string())).is_err());
    assert_eq!(fsm.phase(), UpgradePhase::Pending);

    fsm.process(PhaseEvent::Start).unwrap();
    fsm.process(PhaseEvent::RolledBack("install failed".to_string())).unwrap();
    assert_eq!(fsm.phase(), UpgradePhase::RolledBack);
}

#[test]
fn test_invalid_transition() {
    let mut fsm = PhaseMachine::new();

    // Cannot install before checks ran
    assert_err!(fsm.process(PhaseEvent::Installed));
    assert_err!(fsm.process(PhaseEvent::Verified));
    assert_eq!(fsm.phase(), UpgradePhase::Pending);
}

#[test]
fn test_phase_names() {
    assert_eq!(UpgradePhase::PreCheck.to_string(), "pre_check");
    assert_eq!(UpgradePhase::RolledBack.to_string(), "rolled_back");
    assert_eq!(
        serde_json::to_value(UpgradePhase::Verifying).unwrap(),
        serde_json::json!("verifying")
    );
}

#[test]
fn test_terminal_phases_share_last_ordinal() {
    assert_eq!(UpgradePhase::Pending.ordinal(), 0);
    assert_eq!(UpgradePhase::Verifying.ordinal(), 7);
    assert_eq!(UpgradePhase::Completed.ordinal(), 8);
    assert_eq!(UpgradePhase::Failed.ordinal(), 8);
    assert_eq!(UpgradePhase::RolledBack.ordinal(), 8);
}

#[test]
fn test_status_rejects_skipped_phases() {
    let mut status = DeviceStatus::new("job-1", "r1", "21.4R3", "junos-install.tgz");
    status.update_phase(PhaseEvent::Start, "checking").unwrap();
    let err = assert_err!(status.update_phase(PhaseEvent::Validated, "validated"));
    assert_eq!(err.kind(), "InternalError");
    assert_eq!(status.phase(), UpgradePhase::PreCheck);
    assert_eq!(status.phase_message, "checking");
}
