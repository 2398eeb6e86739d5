//! Per-device upgrade pipeline
//!
//! One [`DeviceUpgrader`] drives one device through the phase machine:
//! pre-check, backup, connectivity, version policy, install, reboot and
//! verification. Failures after the install starts go down the rollback
//! path. Every run ends in exactly one terminal phase and emits exactly one
//! OPERATION_COMPLETE event carrying the final [`UpgradeResult`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::context::RunContext;
use super::installer::SoftwareInstaller;
use super::phase::{PhaseEvent, UpgradePhase};
use super::rollback::{RollbackManager, RollbackOutcome};
use super::validator::PostUpgradeValidator;
use crate::connectivity::ReachabilityMonitor;
use crate::device::connector::{DeviceConnector, SessionSlot};
use crate::device::rpc::{self, InterfaceInfo};
use crate::errors::UpgradeError;
use crate::models::job::{JobCommand, UpgradeRequest};
use crate::models::result::{RollbackKind, SoftwareState, StepStatus, UpgradeResult};
use crate::models::status::{ConfigBackup, DeviceStatus};
use crate::precheck::{CheckEnv, PreCheckEngine};
use crate::version::{self, VersionAction};

/// Phases counted in DEVICE_PROGRESS, terminal included
const TOTAL_STEPS: usize = 8;

/// How a run ends
enum Ending {
    Completed {
        event: PhaseEvent,
        success: bool,
        message: String,
    },
    Failed(UpgradeError),
    RolledBack {
        error: UpgradeError,
        message: String,
    },
}

pub struct DeviceUpgrader {
    ctx: RunContext,
    request: UpgradeRequest,
    status: DeviceStatus,
    result: UpgradeResult,
    slot: SessionSlot,
    monitor: ReachabilityMonitor,
    software: SoftwareState,
    /// False when the install reply was malformed and success was assumed
    install_confirmed: bool,
}

impl DeviceUpgrader {
    pub fn new(
        ctx: RunContext,
        request: UpgradeRequest,
        connector: DeviceConnector,
        monitor: ReachabilityMonitor,
    ) -> Self {
        let status = DeviceStatus::new(
            &ctx.job_id,
            &ctx.hostname,
            &request.target_version,
            &request.image_filename,
        );
        Self {
            ctx,
            request,
            status,
            result: UpgradeResult::new(),
            slot: SessionSlot::new(connector),
            monitor,
            software: SoftwareState::Previous,
            install_confirmed: true,
        }
    }

    /// Run to a terminal phase and return the final status
    pub async fn run(self) -> DeviceStatus {
        let span = info_span!("device", job = %self.ctx.job_id, host = %self.ctx.hostname);
        self.execute().instrument(span).await
    }

    async fn execute(mut self) -> DeviceStatus {
        info!(
            "[{}] Starting {:?} run (target {})",
            self.ctx.hostname, self.request.command, self.request.target_version
        );

        let ending = match self.request.command {
            JobCommand::PreCheck => self.pre_check_only().await,
            JobCommand::Upgrade => self.upgrade().await,
        };
        let ending = ending.unwrap_or_else(Ending::Failed);

        self.slot.release().await;
        self.finish(ending).await;
        self.status
    }

    async fn transition(&mut self, event: PhaseEvent, message: impl Into<String>) -> Result<UpgradePhase, UpgradeError> {
        let phase = self.status.update_phase(event, message)?;
        info!("[{}] Phase {}: {}", self.ctx.hostname, phase, self.status.phase_message);
        self.ctx
            .emitter
            .device_progress(&self.status, phase.ordinal() as usize, TOTAL_STEPS)
            .await;
        Ok(phase)
    }

    async fn pre_check_only(&mut self) -> Result<Ending, UpgradeError> {
        self.transition(PhaseEvent::Start, "Running pre-upgrade checks").await?;
        self.inspect().await?;
        let can_proceed = self.run_checks().await?;
        if !self.request.image_filename.is_empty() {
            self.validate_image().await?;
        }

        let message = if can_proceed {
            "Pre-check passed: upgrade can proceed"
        } else {
            "Pre-check found critical failures: upgrade would be blocked"
        };
        Ok(Ending::Completed {
            event: PhaseEvent::ChecksReported,
            success: can_proceed,
            message: message.to_string(),
        })
    }

    async fn upgrade(&mut self) -> Result<Ending, UpgradeError> {
        self.pre_check_phase().await?;
        self.backup_phase().await?;
        self.connecting_phase().await?;

        if let Some(message) = self.validating_phase().await? {
            return Ok(Ending::Completed {
                event: PhaseEvent::AlreadyOnTarget,
                success: true,
                message,
            });
        }

        if let Err(e) = self.installing_phase().await {
            return Ok(self.rollback_path(e).await);
        }
        if let Err(e) = self.rebooting_phase().await {
            return Ok(self.rollback_path(e).await);
        }

        let message = match self.verifying_phase().await {
            Ok(message) => message,
            Err(e @ UpgradeError::Installation(_)) => return Ok(self.unconfirmed_install(e).await),
            Err(e) => return Err(e),
        };
        Ok(Ending::Completed {
            event: PhaseEvent::Verified,
            success: true,
            message,
        })
    }

    /// Facts, version classification and the interface baseline
    async fn inspect(&mut self) -> Result<(), UpgradeError> {
        let device = self.slot.acquire().await?;
        let facts = device
            .facts()
            .await
            .map_err(|e| UpgradeError::Connection(format!("unable to read device facts: {}", e.message())))?;
        info!(
            "[{}] {} running {} (serial {})",
            self.ctx.hostname, facts.model, facts.version, facts.serial_number
        );

        let action = if self.request.target_version.is_empty() {
            VersionAction::Unknown
        } else {
            version::compare(&facts.version, &self.request.target_version)
        };
        let risk = self.ctx.options.risk_table.risk(action);
        info!(
            "[{}] Version transition {} -> {}: {} ({} risk)",
            self.ctx.hostname,
            facts.version,
            self.request.target_version,
            action.as_str(),
            risk
        );

        self.status.current_version = Some(facts.version.clone());
        self.status.version_action = action;
        self.status.risk = risk;
        self.result.initial_version = Some(facts.version);
        self.result.version_action = action;
        self.result.risk = risk;

        match device
            .call_as::<InterfaceInfo>(rpc::GET_INTERFACES, json!({ "terse": true }))
            .await
        {
            Ok(info) => self.status.baseline.interface_count = Some(info.interfaces.len()),
            Err(e) => debug!("[{}] No interface baseline: {}", self.ctx.hostname, e),
        }
        Ok(())
    }

    /// Run the battery; returns whether the upgrade may proceed
    async fn run_checks(&mut self) -> Result<bool, UpgradeError> {
        let started = Instant::now();
        let env = CheckEnv {
            hostname: self.ctx.hostname.clone(),
            image_filename: self.request.image_filename.clone(),
            image_dir: self.ctx.options.installer.package_dir.clone(),
            current_version: self.status.current_version.clone().unwrap_or_default(),
            target_version: self.request.target_version.clone(),
            thresholds: self.ctx.options.thresholds.clone(),
        };

        let mut engine = PreCheckEngine::standard();
        if let Some(ids) = &self.request.selected_checks {
            engine = engine.select(ids);
        }
        let engine = engine.with_observer(Arc::new(self.ctx.emitter.clone()));

        let device = self.slot.acquire().await?;
        let summary = engine.run_all(device, &env).await;
        self.ctx.emitter.pre_check_complete(&summary).await;

        let can_proceed = summary.can_proceed();
        let message = format!(
            "{}/{} checks passed, {} warning(s), {} critical",
            summary.passed(),
            summary.total(),
            summary.warnings(),
            summary.critical_failures()
        );
        let step_status = if can_proceed {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        self.result.add_step("pre_check", step_status, message, started.elapsed());
        self.status.pre_check_summary = Some(summary);
        Ok(can_proceed)
    }

    /// Validation-only package request; a rejection becomes a warning
    async fn validate_image(&mut self) -> Result<(), UpgradeError> {
        let started = Instant::now();
        let installer = SoftwareInstaller::new(self.ctx.clone(), &self.request.image_filename);
        let device = self.slot.acquire().await?;

        let (valid, message) = installer.validate_package(device).await?;
        if valid {
            self.result
                .add_step("package_validation", StepStatus::Completed, message, started.elapsed());
        } else {
            let message = format!("Package validation failed: {}", message);
            self.status.add_warning(message.clone());
            self.result
                .add_step("package_validation", StepStatus::Warning, message, started.elapsed());
        }
        Ok(())
    }

    async fn pre_check_phase(&mut self) -> Result<(), UpgradeError> {
        self.transition(PhaseEvent::Start, "Running pre-upgrade checks").await?;
        self.inspect().await?;

        if self.request.skip_pre_check {
            warn!("[{}] Pre-upgrade checks skipped on request", self.ctx.hostname);
            self.status.add_warning("Pre-upgrade checks were skipped");
            self.result.add_step(
                "pre_check",
                StepStatus::Skipped,
                "skipped on request",
                Duration::ZERO,
            );
            return Ok(());
        }

        if self.run_checks().await? {
            return Ok(());
        }

        let critical = self
            .status
            .pre_check_summary
            .as_ref()
            .map(|s| s.critical_names().join(", "))
            .unwrap_or_default();
        if self.request.force {
            warn!("[{}] Proceeding despite critical pre-check failures (force)", self.ctx.hostname);
            self.status
                .add_warning(format!("Critical pre-check failures overridden by force: {}", critical));
            Ok(())
        } else {
            Err(UpgradeError::PreCheck(format!("critical pre-check failures: {}", critical)))
        }
    }

    async fn backup_phase(&mut self) -> Result<(), UpgradeError> {
        self.transition(PhaseEvent::ChecksPassed, "Saving rescue configuration").await?;
        let started = Instant::now();
        let device = self.slot.acquire().await?;

        let backup = match device.call(rpc::SAVE_RESCUE_CONFIGURATION, json!({})).await {
            Ok(_) => {
                info!("[{}] Rescue configuration saved", self.ctx.hostname);
                self.result
                    .add_step("backup", StepStatus::Completed, "rescue configuration saved", started.elapsed());
                ConfigBackup {
                    rescue_saved: true,
                    message: "Rescue configuration saved".to_string(),
                    captured_at: Utc::now(),
                }
            }
            Err(e) => {
                let message = format!("Configuration backup failed: {}", e.message());
                warn!("[{}] {}", self.ctx.hostname, message);
                self.status.add_warning(message.clone());
                self.result
                    .add_step("backup", StepStatus::Warning, message.clone(), started.elapsed());
                ConfigBackup {
                    rescue_saved: false,
                    message,
                    captured_at: Utc::now(),
                }
            }
        };
        self.status.config_backup = Some(backup);
        Ok(())
    }

    async fn connecting_phase(&mut self) -> Result<(), UpgradeError> {
        self.transition(PhaseEvent::BackupDone, "Verifying device connectivity").await?;
        let started = Instant::now();

        self.monitor.quick_check().await?;
        let timeout = self.monitor.options().protocol_timeout;
        let device = self.slot.acquire().await?;
        device
            .probe(timeout)
            .await
            .map_err(|e| UpgradeError::Connection(format!("liveness probe failed: {}", e.message())))?;

        self.result
            .add_step("connectivity", StepStatus::Completed, "device reachable", started.elapsed());
        Ok(())
    }

    /// Version policy; `Some` means nothing to install
    async fn validating_phase(&mut self) -> Result<Option<String>, UpgradeError> {
        self.transition(PhaseEvent::Connected, "Validating version transition").await?;

        let action = self.status.version_action;
        let current = self.status.current_version.clone().unwrap_or_default();
        let target = self.request.target_version.clone();
        let force = self.request.force;

        match action {
            VersionAction::SameVersion if !force => {
                let message = format!("Device already running target version {}", target);
                info!("[{}] {}", self.ctx.hostname, message);
                self.status.add_warning(message.clone());
                self.result
                    .add_step("version_validation", StepStatus::Skipped, message.clone(), Duration::ZERO);
                return Ok(Some(message));
            }
            VersionAction::SameVersion => {
                self.status
                    .add_warning(format!("Reinstalling running version {} (force)", target));
            }
            action if self.ctx.options.risk_table.requires_force(action) && !force => {
                return Err(UpgradeError::Policy(format!(
                    "{} from {} to {} is {} risk",
                    action.as_str(),
                    current,
                    target,
                    self.status.risk
                )));
            }
            action if action.is_downgrade() => {
                self.status.add_warning(format!(
                    "Downgrade from {} to {} ({} risk)",
                    current, target, self.status.risk
                ));
            }
            VersionAction::Unknown => {
                self.status.add_warning(format!(
                    "Unable to classify version transition {} -> {}",
                    current, target
                ));
            }
            _ => {}
        }

        self.result.add_step(
            "version_validation",
            StepStatus::Completed,
            format!("{} ({} risk)", action.as_str(), self.status.risk),
            Duration::ZERO,
        );
        Ok(None)
    }

    async fn installing_phase(&mut self) -> Result<(), UpgradeError> {
        self.transition(
            PhaseEvent::Validated,
            format!("Installing {}", self.request.image_filename),
        )
        .await?;
        let started = Instant::now();
        let installer = SoftwareInstaller::new(self.ctx.clone(), &self.request.image_filename);

        let device = self.slot.acquire().await?;
        let outcome = match installer.install(device).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.result
                    .add_step("install", StepStatus::Failed, e.detail(), started.elapsed());
                return Err(e);
            }
        };

        self.software = SoftwareState::Target;
        self.install_confirmed = outcome.is_confirmed();
        self.result.install_status = Some(outcome.status().to_string());
        self.result.reboot_required = true;
        let step_status = if outcome.is_confirmed() {
            StepStatus::Completed
        } else {
            self.status.add_warning(outcome.message());
            StepStatus::Warning
        };
        self.result
            .add_step("install", step_status, outcome.message(), started.elapsed());
        Ok(())
    }

    async fn rebooting_phase(&mut self) -> Result<(), UpgradeError> {
        self.transition(PhaseEvent::Installed, "Waiting for device to reboot").await?;
        self.slot.release().await;
        self.result.reboot_performed = true;

        let options = self.monitor.options().clone();
        match self
            .monitor
            .wait_for_reboot(options.max_wait, options.polling_interval)
            .await
        {
            Ok(report) => {
                self.result.reboot_wait_secs = report.elapsed.as_secs_f64();
                self.result.add_step(
                    "reboot",
                    StepStatus::Completed,
                    format!("device recovered after {}s", report.elapsed.as_secs()),
                    report.elapsed,
                );
                Ok(())
            }
            Err(e) => {
                self.software = SoftwareState::Unknown;
                self.result.reboot_wait_secs = options.max_wait.as_secs_f64();
                self.result
                    .add_step("reboot", StepStatus::Failed, e.detail(), options.max_wait);
                Err(e)
            }
        }
    }

    async fn verifying_phase(&mut self) -> Result<String, UpgradeError> {
        self.transition(PhaseEvent::Recovered, "Verifying upgraded device").await?;
        let started = Instant::now();
        let device = self.slot.acquire().await?;

        let facts = device
            .facts()
            .await
            .map_err(|e| UpgradeError::Connection(format!("unable to read facts after reboot: {}", e.message())))?;
        let target = &self.request.target_version;
        self.status.final_version = Some(facts.version.clone());
        self.result.final_version = Some(facts.version.clone());

        if version::compare(&facts.version, target) == VersionAction::SameVersion {
            info!("[{}] Running target version {}", self.ctx.hostname, facts.version);
        } else if !self.install_confirmed {
            // An assumed install only counts once the device runs the target
            let unchanged = self.result.initial_version.as_deref() == Some(facts.version.as_str());
            self.software = if unchanged {
                SoftwareState::Previous
            } else {
                SoftwareState::Unknown
            };
            self.result
                .add_step("verify", StepStatus::Failed, "installation not confirmed", started.elapsed());
            return Err(UpgradeError::Installation(format!(
                "installation could not be confirmed: expected {} after reboot, device runs {}",
                target, facts.version
            )));
        } else {
            warn!(
                "[{}] Version mismatch: expected {}, running {}",
                self.ctx.hostname, target, facts.version
            );
            self.status.add_warning(format!(
                "Version mismatch after upgrade: expected {}, running {}",
                target, facts.version
            ));
            self.software = SoftwareState::Unknown;
        }

        let report = PostUpgradeValidator::new(&self.ctx.hostname, &self.status.baseline)
            .run_all(device)
            .await?;
        for issue in &report.issues {
            self.status.add_warning(issue.clone());
        }
        let step_status = if report.is_healthy() {
            StepStatus::Completed
        } else {
            StepStatus::Warning
        };
        self.result
            .add_step("verify", step_status, report.summary(), started.elapsed());

        Ok(format!(
            "Upgrade completed: {} -> {}",
            self.status.current_version.as_deref().unwrap_or("unknown"),
            facts.version
        ))
    }

    async fn rollback_path(&mut self, error: UpgradeError) -> Ending {
        let reason = error.detail();
        error!("[{}] {}; starting rollback", self.ctx.hostname, error);
        self.result.add_error(error.to_string());
        self.result.rollback_reason = Some(reason.clone());
        let manager = RollbackManager::new(self.ctx.clone());

        let device = match self.slot.acquire().await {
            Ok(device) => device,
            Err(e) => {
                let cause = format!("unable to open a session for rollback: {}", e.detail());
                return self.rollback_failed(&manager, None, cause).await;
            }
        };

        let outcome = match manager.rollback(device, &reason).await {
            Ok(outcome) => outcome,
            Err(e) => return self.rollback_failed(&manager, None, e.detail()).await,
        };
        let kind = outcome.kind();
        self.result.rollback_performed = true;
        self.result.rollback_kind = Some(kind);

        match outcome {
            RollbackOutcome::PackageStaged { message } => {
                let message = format!(
                    "Rollback staged, completion unconfirmed: {}; {}",
                    message,
                    self.software.describe()
                );
                warn!("[{}] {}", self.ctx.hostname, message);
                manager.finish(false, Some(kind), &message).await;
                Ending::Failed(UpgradeError::Rollback(message))
            }
            RollbackOutcome::Configuration { message } => {
                let report = manager.validate(device).await;
                for issue in report.issues {
                    self.status.add_warning(format!("After rollback: {}", issue));
                }
                self.status.add_warning(message.clone());
                manager.finish(true, Some(kind), &message).await;
                Ending::RolledBack { error, message }
            }
            RollbackOutcome::PackageRebooting { .. } => {
                self.slot.release().await;
                self.result.reboot_performed = true;

                if let Err(e) = manager.wait_for_recovery(&self.monitor).await {
                    self.software = SoftwareState::Unknown;
                    return self.rollback_failed(&manager, Some(kind), e.detail()).await;
                }
                let device = match self.slot.acquire().await {
                    Ok(device) => device,
                    Err(e) => {
                        self.software = SoftwareState::Unknown;
                        let cause = format!("unable to reconnect after rollback: {}", e.detail());
                        return self.rollback_failed(&manager, Some(kind), cause).await;
                    }
                };

                match device.facts().await {
                    Ok(facts) => {
                        let back = self.status.current_version.as_deref() == Some(facts.version.as_str());
                        self.software = if back {
                            SoftwareState::Previous
                        } else {
                            SoftwareState::Unknown
                        };
                        self.status.final_version = Some(facts.version.clone());
                        self.result.final_version = Some(facts.version);
                    }
                    Err(e) => {
                        debug!("[{}] Facts after rollback unavailable: {}", self.ctx.hostname, e);
                        self.software = SoftwareState::Previous;
                    }
                }

                let report = manager.validate(device).await;
                for issue in report.issues {
                    self.status.add_warning(format!("After rollback: {}", issue));
                }
                let message = format!(
                    "Rolled back to previous software ({})",
                    self.status.final_version.as_deref().unwrap_or("version unknown")
                );
                manager.finish(true, Some(kind), &message).await;
                Ending::RolledBack { error, message }
            }
        }
    }

    /// Assumed install that the device does not confirm
    async fn unconfirmed_install(&mut self, error: UpgradeError) -> Ending {
        if self.software != SoftwareState::Previous {
            return self.rollback_path(error).await;
        }
        warn!(
            "[{}] Device never left its previous software; nothing to roll back",
            self.ctx.hostname
        );
        Ending::Failed(UpgradeError::Installation(format!(
            "{}; {}",
            error.detail(),
            self.software.describe()
        )))
    }

    async fn rollback_failed(
        &mut self,
        manager: &RollbackManager,
        kind: Option<RollbackKind>,
        cause: String,
    ) -> Ending {
        let message = format!("Rollback failed: {}; {}", cause, self.software.describe());
        error!("[{}] {}", self.ctx.hostname, message);
        manager.finish(false, kind, &message).await;
        Ending::Failed(UpgradeError::Rollback(message))
    }

    async fn finish(&mut self, ending: Ending) {
        let (success, message) = match ending {
            Ending::Completed { event, success, message } => {
                match self.transition(event, message.clone()).await {
                    Ok(_) => (success, message),
                    Err(e) => self.fail(e).await,
                }
            }
            Ending::Failed(e) => self.fail(e).await,
            Ending::RolledBack { error, message } => {
                self.status.set_error(error.detail(), error.kind());
                match self
                    .transition(PhaseEvent::RolledBack(error.detail()), message.clone())
                    .await
                {
                    Ok(_) => (false, message),
                    Err(e) => self.fail(e).await,
                }
            }
        };

        self.result.software_state = self.software;
        self.result.warnings = self.status.warnings.clone();
        self.result.finalize(success);
        self.status.upgrade_result = Some(self.result.clone());

        if success {
            info!("[{}] {}", self.ctx.hostname, message);
        } else {
            warn!("[{}] Finished in {}: {}", self.ctx.hostname, self.status.phase(), message);
        }
        self.ctx
            .emitter
            .operation_complete(&self.status, success, message)
            .await;
    }

    async fn fail(&mut self, error: UpgradeError) -> (bool, String) {
        let message = error.to_string();
        error!("[{}] {}", self.ctx.hostname, message);
        self.status.set_error(error.detail(), error.kind());
        self.result.add_error(message.clone());
        if let Some(hint) = error.remediation() {
            self.status.add_warning(format!("Remediation: {}", hint));
        }
        if let Err(e) = self
            .transition(PhaseEvent::Fail(error.detail()), message.clone())
            .await
        {
            error!("[{}] Unable to record failure: {}", self.ctx.hostname, e);
        }
        (false, message)
    }
}
