//! Installer fallback and tolerance tests

use std::sync::Arc;
use std::time::Duration;

use upgrade_agent::app::options::UpgradeOptions;
use upgrade_agent::device::connector::{self, DeviceConnector, DeviceHandle};
use upgrade_agent::device::sim::{SimInstall, SimScenario, SimulatedTransport};
use upgrade_agent::models::event::{EventType, UpgradeEvent};
use upgrade_agent::models::job::ConnectionParams;
use upgrade_agent::progress::emitter::{self, EventEmitter};
use upgrade_agent::progress::sink::ChannelSink;
use upgrade_agent::upgrade::context::RunContext;
use upgrade_agent::upgrade::installer::{InstallOutcome, ResponseTolerancePolicy, SoftwareInstaller};
use tokio::sync::mpsc::UnboundedReceiver;

const IMAGE: &str = "junos-install.tgz";

fn params() -> ConnectionParams {
    ConnectionParams {
        host: "r1".to_string(),
        username: "admin".to_string(),
        password: "pw".into(),
        port: 22,
        connect_timeout: Duration::from_secs(30),
    }
}

async fn setup(
    scenario: SimScenario,
    options: UpgradeOptions,
) -> (SimulatedTransport, DeviceHandle, SoftwareInstaller, UnboundedReceiver<UpgradeEvent>) {
    let sim = SimulatedTransport::new(scenario);
    let device = DeviceConnector::new(Arc::new(sim.clone()), params(), connector::Options::default())
        .connect()
        .await
        .unwrap();
    let (sink, events) = ChannelSink::new();
    let emitter = EventEmitter::new(Arc::new(sink), emitter::Options::default(), "job-1", "r1");
    let ctx = RunContext::new("job-1", "r1", Arc::new(options), emitter);
    (sim, device, SoftwareInstaller::new(ctx, IMAGE), events)
}

fn scenario(attempts: Vec<SimInstall>) -> SimScenario {
    SimScenario {
        install_attempts: attempts,
        ..SimScenario::with_version("20.4R3")
    }
}

#[tokio::test(start_paused = true)]
async fn test_validated_install() {
    let (sim, mut device, installer, _events) = setup(scenario(vec![]), UpgradeOptions::default()).await;

    let outcome = installer.install(&mut device).await.unwrap();
    assert_eq!(outcome.status(), "installed");

    let snapshot = sim.snapshot().await;
    assert_eq!(snapshot.installs.len(), 1);
    assert!(snapshot.installs[0].validate);
    assert!(snapshot.installs[0].reboot);
    assert_eq!(snapshot.installs[0].package, "/var/tmp/junos-install.tgz");
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_falls_back_once() {
    let attempts = vec![
        SimInstall::Fail {
            message: "package validation error".to_string(),
        },
        SimInstall::Ok {
            message: "installed".to_string(),
        },
    ];
    let (sim, mut device, installer, _events) = setup(scenario(attempts), UpgradeOptions::default()).await;

    let outcome = installer.install(&mut device).await.unwrap();
    assert!(matches!(outcome, InstallOutcome::InstalledWithoutValidation { .. }));
    assert!(outcome.message().contains("without package validation"));
    assert!(outcome.is_confirmed());

    let installs = sim.snapshot().await.installs;
    assert_eq!(installs.len(), 2);
    assert!(installs[0].validate);
    assert!(!installs[1].validate);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_failure_is_installation_error() {
    let attempts = vec![
        SimInstall::Fail {
            message: "package validation error".to_string(),
        },
        SimInstall::Fail {
            message: "not enough space".to_string(),
        },
    ];
    let (sim, mut device, installer, _events) = setup(scenario(attempts), UpgradeOptions::default()).await;

    let err = installer.install(&mut device).await.unwrap_err();
    assert_eq!(err.kind(), "InstallationFailure");
    assert_eq!(err.detail(), "not enough space");
    assert_eq!(sim.snapshot().await.installs.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_response_assumed_success() {
    let attempts = vec![SimInstall::RpcError {
        message: "XMLSyntaxError: not well-formed (invalid token): line 1".to_string(),
    }];
    let (sim, mut device, installer, mut events) = setup(scenario(attempts), UpgradeOptions::default()).await;

    let outcome = installer.install(&mut device).await.unwrap();
    assert_eq!(outcome.status(), "assumed_installed_malformed_response");
    assert!(!outcome.is_confirmed());
    assert_eq!(sim.snapshot().await.installs.len(), 1);

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::UpgradeProgress && event.data["status"] == "warning" {
            warned = true;
        }
    }
    assert!(warned);
}

#[tokio::test(start_paused = true)]
async fn test_empty_policy_makes_malformed_response_fatal() {
    let attempts = vec![SimInstall::RpcError {
        message: "XMLSyntaxError: not well-formed (invalid token): line 1".to_string(),
    }];
    let options = UpgradeOptions {
        tolerance: ResponseTolerancePolicy::strict(),
        ..Default::default()
    };
    let (_sim, mut device, installer, _events) = setup(scenario(attempts), options).await;

    let err = installer.install(&mut device).await.unwrap_err();
    assert_eq!(err.kind(), "InstallationFailure");
}

#[tokio::test(start_paused = true)]
async fn test_validate_package_reports_rejection() {
    let mut scenario = SimScenario::with_version("20.4R3");
    scenario.rpc_errors.insert(
        upgrade_agent::device::rpc::VALIDATE_PACKAGE.to_string(),
        "package is corrupt".to_string(),
    );
    let (_sim, mut device, installer, _events) = setup(scenario, UpgradeOptions::default()).await;

    let (valid, message) = installer.validate_package(&mut device).await.unwrap();
    assert!(!valid);
    assert_eq!(message, "package is corrupt");
}
