//! Rollback after a failed install or reboot

use serde_json::json;
use tracing::{error, info, warn};

use super::context::RunContext;
use super::validator::ValidationReport;
use crate::connectivity::{ReachabilityMonitor, RecoveryReport};
use crate::device::connector::DeviceHandle;
use crate::device::rpc::{self, BgpSummary, InterfaceInfo, UptimeInfo};
use crate::errors::UpgradeError;
use crate::models::result::RollbackKind;

/// Accepted rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Package rollback accepted and the device is rebooting into it
    PackageRebooting { message: String },
    /// Package rollback accepted but the reboot request failed
    PackageStaged { message: String },
    /// Package rollback rejected; the previous configuration was committed instead
    Configuration { message: String },
}

impl RollbackOutcome {
    pub fn kind(&self) -> RollbackKind {
        match self {
            RollbackOutcome::PackageRebooting { .. } => RollbackKind::Package,
            RollbackOutcome::PackageStaged { .. } => RollbackKind::PackageStaged,
            RollbackOutcome::Configuration { .. } => RollbackKind::Configuration,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RollbackOutcome::PackageRebooting { message }
            | RollbackOutcome::PackageStaged { message }
            | RollbackOutcome::Configuration { message } => message,
        }
    }
}

pub struct RollbackManager {
    ctx: RunContext,
}

impl RollbackManager {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    /// Request a package rollback, falling back to a configuration rollback
    pub async fn rollback(&self, device: &mut DeviceHandle, reason: &str) -> Result<RollbackOutcome, UpgradeError> {
        let host = &self.ctx.hostname;
        let emitter = &self.ctx.emitter;
        warn!("[{}] Initiating automatic rollback: {}", host, reason);
        emitter.rollback_progress("initiated", format!("Rollback initiated: {}", reason)).await;

        match device.call(rpc::PACKAGE_ROLLBACK, json!({})).await {
            Ok(_) => {
                info!("[{}] Package rollback accepted", host);
            }
            Err(e) if e.is_rpc() => {
                warn!("[{}] Package rollback rejected ({}), rolling back configuration", host, e);
                return self.configuration_rollback(device, &e.message()).await;
            }
            Err(e) => {
                let message = format!("package rollback request failed: {}", e.message());
                error!("[{}] {}", host, message);
                return Err(UpgradeError::Rollback(message));
            }
        }

        match device.reboot().await {
            Ok(()) => {
                let message = "Package rollback accepted; device rebooting".to_string();
                emitter.rollback_progress("rebooting", message.clone()).await;
                Ok(RollbackOutcome::PackageRebooting { message })
            }
            Err(e) => {
                let message = format!(
                    "Package rollback staged but the reboot request failed: {}",
                    e.message()
                );
                warn!("[{}] {}", host, message);
                Ok(RollbackOutcome::PackageStaged { message })
            }
        }
    }

    async fn configuration_rollback(
        &self,
        device: &mut DeviceHandle,
        package_error: &str,
    ) -> Result<RollbackOutcome, UpgradeError> {
        let loaded = device
            .call(rpc::LOAD_CONFIGURATION, json!({ "rollback": 1 }))
            .await;
        let committed = match loaded {
            Ok(_) => {
                device
                    .call(
                        rpc::COMMIT_CONFIGURATION,
                        json!({ "comment": "automatic rollback after failed upgrade" }),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match committed {
            Ok(_) => {
                let message = format!(
                    "Package rollback rejected ({}); configuration rolled back to generation 1",
                    package_error
                );
                info!("[{}] {}", self.ctx.hostname, message);
                Ok(RollbackOutcome::Configuration { message })
            }
            Err(e) => {
                let message = format!(
                    "package rollback rejected ({}) and configuration rollback failed: {}",
                    package_error,
                    e.message()
                );
                error!("[{}] {}", self.ctx.hostname, message);
                Err(UpgradeError::Rollback(message))
            }
        }
    }

    /// Wait for the device to come back from the rollback reboot
    pub async fn wait_for_recovery(&self, monitor: &ReachabilityMonitor) -> Result<RecoveryReport, UpgradeError> {
        let options = monitor.options();
        self.ctx
            .emitter
            .rollback_progress("recovering", "Waiting for device recovery after rollback")
            .await;

        match monitor.wait_for_reboot(options.max_wait, options.polling_interval).await {
            Ok(report) => {
                info!(
                    "[{}] Device recovered after rollback in {}s",
                    self.ctx.hostname,
                    report.elapsed.as_secs()
                );
                Ok(report)
            }
            Err(e) => {
                let message = format!("device did not recover after rollback: {}", e.detail());
                Err(UpgradeError::Rollback(message))
            }
        }
    }

    /// Uptime, interface and BGP scan; errors become issues
    pub async fn validate(&self, device: &mut DeviceHandle) -> ValidationReport {
        self.ctx
            .emitter
            .rollback_progress("validating", "Validating device after rollback")
            .await;
        let mut report = ValidationReport::default();

        match device.call_as::<UptimeInfo>(rpc::GET_UPTIME, json!({})).await {
            Ok(uptime) => info!("[{}] Uptime after rollback: {}s", self.ctx.hostname, uptime.uptime_secs),
            Err(e) => report.issues.push(format!("Uptime probe failed: {}", e.message())),
        }

        match device.call_as::<InterfaceInfo>(rpc::GET_INTERFACES, json!({ "terse": true })).await {
            Ok(interfaces) => {
                let down = interfaces.mismatched();
                if !down.is_empty() {
                    report
                        .issues
                        .push(format!("Interfaces admin-up but oper-down: {}", down.join(", ")));
                }
            }
            Err(e) => report.issues.push(format!("Interface scan failed: {}", e.message())),
        }

        match device.call_as::<BgpSummary>(rpc::GET_BGP_SUMMARY, json!({})).await {
            Ok(bgp) => {
                let down: Vec<&str> = bgp.down().iter().map(|p| p.address.as_str()).collect();
                if !down.is_empty() {
                    report.issues.push(format!("BGP peers not established: {}", down.join(", ")));
                }
            }
            Err(e) => report.issues.push(format!("BGP scan failed: {}", e.message())),
        }

        if !report.is_healthy() {
            warn!("[{}] Rollback validation: {}", self.ctx.hostname, report.summary());
        }
        report
    }

    /// Final rollback notice; the only place the `failed` stage is sent
    pub async fn finish(&self, success: bool, kind: Option<RollbackKind>, message: &str) {
        let stage = if success { "completed" } else { "failed" };
        self.ctx.emitter.rollback_progress(stage, message).await;
        self.ctx.emitter.rollback_complete(success, kind, message).await;
    }
}
