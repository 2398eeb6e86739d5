//! End-to-end device runs against scripted devices

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use upgrade_agent::app::options::UpgradeOptions;
use upgrade_agent::app::run::JobRunner;
use upgrade_agent::device::rpc;
use upgrade_agent::device::sim::{SimBoot, SimInstall, SimScenario, SimulatedTransport};
use upgrade_agent::models::event::{EventType, UpgradeEvent};
use upgrade_agent::models::job::{JobCommand, UpgradeJob};
use upgrade_agent::models::result::{RollbackKind, SoftwareState};
use upgrade_agent::models::status::DeviceStatus;
use upgrade_agent::progress::sink::ChannelSink;
use upgrade_agent::upgrade::phase::UpgradePhase;
use upgrade_agent::version::{RiskLevel, VersionAction};

const IMAGE: &str = "junos-install.tgz";

fn upgrade_job(target: &str, force: bool) -> UpgradeJob {
    serde_json::from_value(json!({
        "job_id": "job-1",
        "hostname": "r1",
        "username": "admin",
        "password": "pw",
        "target_version": target,
        "image_filename": IMAGE,
        "force": force,
    }))
    .unwrap()
}

async fn run_one(sim: &SimulatedTransport, job: UpgradeJob) -> (DeviceStatus, Vec<UpgradeEvent>) {
    let (sink, rx) = ChannelSink::new();
    let runner = JobRunner::new(
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        Arc::new(sink),
        UpgradeOptions::default(),
        4,
    );
    let mut statuses = runner.run_job(&job).await.unwrap();
    assert_eq!(statuses.len(), 1);
    (statuses.remove(0), drain(rx))
}

fn drain(mut rx: UnboundedReceiver<UpgradeEvent>) -> Vec<UpgradeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count(events: &[UpgradeEvent], event_type: EventType) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

fn upgradable(current: &str, target: &str) -> SimScenario {
    SimScenario {
        installed_version: Some(target.to_string()),
        ..SimScenario::with_version(current)
    }
}

#[tokio::test(start_paused = true)]
async fn test_major_upgrade_with_bgp_peer_down_afterwards() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.after_reboot_responses.insert(
        rpc::GET_BGP_SUMMARY.to_string(),
        json!({"peers": [
            {"address": "10.0.0.1", "state": "Established"},
            {"address": "10.0.0.2", "state": "Idle"}
        ]}),
    );
    let sim = SimulatedTransport::new(scenario);

    let (status, events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Completed);
    assert_eq!(status.version_action, VersionAction::MajorUpgrade);
    assert_eq!(status.risk, RiskLevel::Medium);
    assert_eq!(status.final_version.as_deref(), Some("21.4R3"));
    assert_eq!(status.warnings.len(), 1, "warnings: {:?}", status.warnings);
    assert!(status.warnings[0].contains("BGP"));

    let result = status.upgrade_result.as_ref().unwrap();
    assert!(result.success);
    assert!(result.reboot_performed);
    assert!(!result.rollback_performed);
    assert_eq!(result.software_state, SoftwareState::Target);
    assert_eq!(result.initial_version.as_deref(), Some("20.4R3"));

    assert_eq!(count(&events, EventType::OperationComplete), 1);
    assert_eq!(count(&events, EventType::PreCheckComplete), 1);
    assert_eq!(count(&events, EventType::PreCheckResult), 11);

    // Steps never move backwards
    let steps: Vec<u64> = events
        .iter()
        .filter(|e| e.event_type == EventType::DeviceProgress)
        .filter_map(|e| e.data["step"].as_u64())
        .collect();
    assert!(steps.windows(2).all(|w| w[0] <= w[1]), "steps: {:?}", steps);
    assert_eq!(steps.last(), Some(&8));

    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::OperationComplete);
    assert_eq!(last.data["success"], true);
}

#[tokio::test(start_paused = true)]
async fn test_install_rpc_error_rolls_back() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.install_attempts = vec![SimInstall::RpcError {
        message: "mgd: error: configuration database locked".to_string(),
    }];
    let sim = SimulatedTransport::new(scenario);

    let (status, events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::RolledBack);
    let result = status.upgrade_result.as_ref().unwrap();
    assert!(!result.success);
    assert!(result.rollback_performed);
    assert_eq!(result.rollback_kind, Some(RollbackKind::Package));
    assert_eq!(
        result.rollback_reason.as_deref(),
        Some("mgd: error: configuration database locked")
    );
    assert_eq!(result.software_state, SoftwareState::Previous);
    assert_eq!(status.final_version.as_deref(), Some("20.4R3"));
    assert_eq!(status.error.as_ref().unwrap().kind, "InstallationFailure");

    let snapshot = sim.snapshot().await;
    assert!(snapshot.calls.iter().any(|c| c == rpc::PACKAGE_ROLLBACK));
    assert_eq!(snapshot.reboot_requests, 1);

    assert_eq!(count(&events, EventType::RollbackComplete), 1);
    assert_eq!(count(&events, EventType::OperationComplete), 1);
    let stages: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::RollbackProgress)
        .filter_map(|e| e.data["stage"].as_str())
        .collect();
    assert_eq!(stages.first(), Some(&"initiated"));
    assert!(stages.contains(&"rebooting"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_package_rollback_reverts_configuration() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.install_attempts = vec![SimInstall::RpcError {
        message: "mgd: error: configuration database locked".to_string(),
    }];
    scenario.rpc_errors.insert(
        rpc::PACKAGE_ROLLBACK.to_string(),
        "no previous software to roll back to".to_string(),
    );
    let sim = SimulatedTransport::new(scenario);

    let (status, _events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::RolledBack);
    let result = status.upgrade_result.as_ref().unwrap();
    assert_eq!(result.rollback_kind, Some(RollbackKind::Configuration));
    let snapshot = sim.snapshot().await;
    assert!(snapshot.calls.iter().any(|c| c == rpc::LOAD_CONFIGURATION));
    assert!(snapshot.calls.iter().any(|c| c == rpc::COMMIT_CONFIGURATION));
    assert_eq!(snapshot.reboot_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_device_lost_after_install_fails_with_unknown_software() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.boot = SimBoot {
        never_recovers: true,
        ..SimBoot::default()
    };
    let sim = SimulatedTransport::new(scenario);

    let (status, _events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Failed);
    let error = status.error.as_ref().unwrap();
    assert_eq!(error.kind, "RollbackError");
    assert!(error.message.contains("unknown"), "message: {}", error.message);

    let result = status.upgrade_result.as_ref().unwrap();
    assert!(!result.success);
    assert_eq!(result.software_state, SoftwareState::Unknown);
    assert!(result.rollback_reason.is_some());
}

fn rollback_stages(events: &[UpgradeEvent]) -> Vec<&str> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::RollbackProgress)
        .filter_map(|e| e.data["stage"].as_str())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_assumed_install_without_reboot_is_not_success() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.install_attempts = vec![SimInstall::RpcError {
        message: "XMLSyntaxError: not well-formed (invalid token): line 1".to_string(),
    }];
    let sim = SimulatedTransport::new(scenario);

    let (status, events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Failed);
    let error = status.error.as_ref().unwrap();
    assert_eq!(error.kind, "InstallationFailure");
    assert!(error.message.contains("could not be confirmed"), "message: {}", error.message);
    assert!(error.message.contains("previous"), "message: {}", error.message);
    assert!(status.warnings.iter().any(|w| w.contains("assumed")));

    let result = status.upgrade_result.as_ref().unwrap();
    assert!(!result.success);
    assert!(!result.rollback_performed);
    assert_eq!(result.software_state, SoftwareState::Previous);
    assert_eq!(result.final_version.as_deref(), Some("20.4R3"));

    assert_eq!(sim.snapshot().await.boots, 0);
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::OperationComplete);
    assert_eq!(last.data["success"], false);
}

#[tokio::test(start_paused = true)]
async fn test_slow_shutdown_is_not_mistaken_for_recovery() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.boot = SimBoot {
        tcp_after_secs: 60,
        protocol_after_secs: 120,
        shutdown_after_secs: 45,
        ..SimBoot::default()
    };
    let sim = SimulatedTransport::new(scenario);

    let (status, _events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Completed);
    assert_eq!(status.final_version.as_deref(), Some("21.4R3"));
    assert!(!status.warnings.iter().any(|w| w.contains("mismatch")));
    let result = status.upgrade_result.as_ref().unwrap();
    assert!(result.reboot_wait_secs >= 165.0, "waited {}", result.reboot_wait_secs);
    assert_eq!(sim.snapshot().await.boots, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_lost_device_reports_failure_once() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.install_attempts = vec![SimInstall::RpcError {
        message: "mgd: error: configuration database locked".to_string(),
    }];
    scenario.boot = SimBoot {
        never_recovers: true,
        ..SimBoot::default()
    };
    let sim = SimulatedTransport::new(scenario);

    let (status, events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Failed);
    assert_eq!(status.error.as_ref().unwrap().kind, "RollbackError");
    let stages = rollback_stages(&events);
    assert_eq!(stages.iter().filter(|s| **s == "failed").count(), 1, "stages: {:?}", stages);
    assert_eq!(stages.last(), Some(&"failed"));
    assert_eq!(count(&events, EventType::RollbackComplete), 1);
}

#[tokio::test(start_paused = true)]
async fn test_staged_rollback_is_reported_as_unconfirmed() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.install_attempts = vec![SimInstall::RpcError {
        message: "mgd: error: configuration database locked".to_string(),
    }];
    scenario.reboot_error = Some("reboot not permitted".to_string());
    let sim = SimulatedTransport::new(scenario);

    let (status, events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Failed);
    let error = status.error.as_ref().unwrap();
    assert!(
        error.message.starts_with("Rollback staged, completion unconfirmed"),
        "message: {}",
        error.message
    );
    assert!(!error.message.contains("Rollback failed"));
    let result = status.upgrade_result.as_ref().unwrap();
    assert_eq!(result.rollback_kind, Some(RollbackKind::PackageStaged));

    let stages = rollback_stages(&events);
    assert_eq!(stages.iter().filter(|s| **s == "failed").count(), 1, "stages: {:?}", stages);
}

fn pre_check_job(target: &str) -> UpgradeJob {
    let mut job = upgrade_job(target, false);
    job.command = JobCommand::PreCheck;
    job
}

#[tokio::test(start_paused = true)]
async fn test_pre_check_validates_package_without_installing() {
    let sim = SimulatedTransport::new(upgradable("20.4R3", "21.4R3"));

    let (status, _events) = run_one(&sim, pre_check_job("21.4R3")).await;

    assert_eq!(status.phase(), UpgradePhase::Completed);
    assert!(status.upgrade_result.as_ref().unwrap().success);
    assert!(status.warnings.is_empty(), "warnings: {:?}", status.warnings);
    let snapshot = sim.snapshot().await;
    assert!(snapshot.calls.iter().any(|c| c == rpc::VALIDATE_PACKAGE));
    assert!(snapshot.installs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pre_check_reports_rejected_package() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.rpc_errors.insert(
        rpc::VALIDATE_PACKAGE.to_string(),
        "package is not signed for this platform".to_string(),
    );
    let sim = SimulatedTransport::new(scenario);

    let (status, _events) = run_one(&sim, pre_check_job("21.4R3")).await;

    assert_eq!(status.phase(), UpgradePhase::Completed);
    assert!(status
        .warnings
        .iter()
        .any(|w| w.starts_with("Package validation failed") && w.contains("not signed")));
    assert!(sim.snapshot().await.installs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_version_completes_without_install() {
    let sim = SimulatedTransport::new(SimScenario::with_version("21.4R3"));

    let (status, events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Completed);
    assert!(status.upgrade_result.as_ref().unwrap().success);
    assert!(status
        .warnings
        .iter()
        .any(|w| w.contains("already running target version")));
    assert!(sim.snapshot().await.installs.is_empty());
    assert_eq!(count(&events, EventType::OperationComplete), 1);
}

#[tokio::test(start_paused = true)]
async fn test_major_downgrade_needs_force() {
    let sim = SimulatedTransport::new(upgradable("21.4R3", "19.4R3"));

    let (status, _events) = run_one(&sim, upgrade_job("19.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Failed);
    assert_eq!(status.error.as_ref().unwrap().kind, "PolicyViolation");
    assert_eq!(status.risk, RiskLevel::High);
    assert!(status.warnings.iter().any(|w| w.starts_with("Remediation:")));
    assert!(sim.snapshot().await.installs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_forced_downgrade_proceeds() {
    let sim = SimulatedTransport::new(upgradable("21.4R3", "19.4R3"));

    let (status, _events) = run_one(&sim, upgrade_job("19.4R3", true)).await;

    assert_eq!(status.phase(), UpgradePhase::Completed);
    assert_eq!(status.version_action, VersionAction::MajorDowngrade);
    assert!(status.warnings.iter().any(|w| w.starts_with("Downgrade")));
    assert_eq!(sim.snapshot().await.installs.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_image_blocks_upgrade() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario
        .responses
        .insert(rpc::FILE_LIST.to_string(), json!({"files": []}));
    let sim = SimulatedTransport::new(scenario);

    let (status, _events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Failed);
    assert_eq!(status.error.as_ref().unwrap().kind, "PreCheckFailure");
    let summary = status.pre_check_summary.as_ref().unwrap();
    assert!(!summary.can_proceed());
    assert!(sim.snapshot().await.installs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_skip_pre_check_warns() {
    let sim = SimulatedTransport::new(upgradable("20.4R3", "21.4R3"));
    let mut job = upgrade_job("21.4R3", false);
    job.skip_pre_check = true;

    let (status, events) = run_one(&sim, job).await;

    assert_eq!(status.phase(), UpgradePhase::Completed);
    assert!(status.pre_check_summary.is_none());
    assert!(status.warnings.iter().any(|w| w.contains("skipped")));
    assert_eq!(count(&events, EventType::PreCheckResult), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_fails_before_mutation() {
    let mut scenario = upgradable("20.4R3", "21.4R3");
    scenario.connect_error = Some("No route to host".to_string());
    let sim = SimulatedTransport::new(scenario);

    let (status, events) = run_one(&sim, upgrade_job("21.4R3", false)).await;

    assert_eq!(status.phase(), UpgradePhase::Failed);
    assert_eq!(status.error.as_ref().unwrap().kind, "ConnectionFailure");
    assert!(sim.snapshot().await.installs.is_empty());
    assert_eq!(count(&events, EventType::OperationComplete), 1);
}
