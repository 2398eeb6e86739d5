//! Package installation with validation fallback and malformed-response tolerance

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::context::RunContext;
use crate::device::connector::DeviceHandle;
use crate::device::{rpc, InstallProgress, InstallReport, InstallRequest};
use crate::errors::{DeviceError, UpgradeError};
use crate::models::result::StepStatus;
use crate::progress::emitter::EventEmitter;
use crate::upgrade::phase::UpgradePhase;

/// Installer options
#[derive(Debug, Clone)]
pub struct Options {
    /// Staging directory holding the image
    pub package_dir: String,

    /// Ceiling for one install request
    pub install_timeout: Duration,

    pub cleanfs: bool,

    /// Pause after assuming a malformed response meant success
    pub assumed_success_pause: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            package_dir: "/var/tmp".to_string(),
            install_timeout: Duration::from_secs(1800),
            cleanfs: true,
            assumed_success_pause: Duration::from_secs(5),
        }
    }
}

/// How an installation error is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallErrorClass {
    RealFailure,
    /// The device answered with a broken document, usually because it
    /// started rebooting into the new image mid-reply
    LikelySuccessMalformedResponse,
}

/// Error texts that mean "the reply was cut off", not "the install failed"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTolerancePolicy {
    signatures: Vec<String>,
}

impl Default for ResponseTolerancePolicy {
    fn default() -> Self {
        Self::new(
            [
                "not well-formed",
                "mismatched tag",
                "unclosed token",
                "xmlsyntaxerror",
                "junk after document element",
                "no element found",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }
}

impl ResponseTolerancePolicy {
    pub fn new(signatures: Vec<String>) -> Self {
        Self {
            signatures: signatures.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Treat every installation error as real
    pub fn strict() -> Self {
        Self { signatures: Vec::new() }
    }

    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// Only RPC and decode errors can be malformed responses
    pub fn classify(&self, error: &DeviceError) -> InstallErrorClass {
        let text = match error {
            DeviceError::Rpc(msg) | DeviceError::Decode(msg) => msg.to_lowercase(),
            _ => return InstallErrorClass::RealFailure,
        };
        if self.signatures.iter().any(|sig| text.contains(sig.as_str())) {
            InstallErrorClass::LikelySuccessMalformedResponse
        } else {
            InstallErrorClass::RealFailure
        }
    }
}

/// Successful installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { message: String },
    InstalledWithoutValidation { message: String },
    AssumedInstalled { message: String },
}

impl InstallOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            InstallOutcome::Installed { .. } => "installed",
            InstallOutcome::InstalledWithoutValidation { .. } => "installed_without_validation",
            InstallOutcome::AssumedInstalled { .. } => "assumed_installed_malformed_response",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            InstallOutcome::Installed { message }
            | InstallOutcome::InstalledWithoutValidation { message }
            | InstallOutcome::AssumedInstalled { message } => message,
        }
    }

    /// False when success was inferred from a malformed reply
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, InstallOutcome::AssumedInstalled { .. })
    }
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status(), self.message())
    }
}

/// Republishes device install reports as UPGRADE_PROGRESS
struct ProgressRelay {
    emitter: EventEmitter,
}

impl ProgressRelay {
    fn interpret(report: InstallReport) -> (Option<u8>, String) {
        const DEFAULT: &str = "Installing software package";
        match report {
            InstallReport::Percent(p) => (Some(p.min(100)), format!("{} ({}%)", DEFAULT, p.min(100))),
            InstallReport::Text(text) => (None, text),
            InstallReport::Structured(value) => {
                let progress = value
                    .get("progress")
                    .and_then(Value::as_u64)
                    .map(|p| p.min(100) as u8);
                let message = value
                    .get("message")
                    .or_else(|| value.get("status"))
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT)
                    .to_string();
                (progress, message)
            }
        }
    }
}

#[async_trait]
impl InstallProgress for ProgressRelay {
    async fn report(&self, report: InstallReport) {
        let (progress, message) = Self::interpret(report);
        info!("[{}] Install progress: {}", self.emitter.device(), message);
        self.emitter
            .upgrade_progress(
                UpgradePhase::Installing,
                "software_install",
                StepStatus::InProgress,
                progress,
                message,
            )
            .await;
    }
}

pub struct SoftwareInstaller {
    ctx: RunContext,
    image_filename: String,
}

impl SoftwareInstaller {
    pub fn new(ctx: RunContext, image_filename: &str) -> Self {
        Self {
            ctx,
            image_filename: image_filename.to_string(),
        }
    }

    pub fn package_path(&self) -> String {
        format!(
            "{}/{}",
            self.ctx.options.installer.package_dir.trim_end_matches('/'),
            self.image_filename
        )
    }

    fn request(&self, validate: bool) -> InstallRequest {
        let options = &self.ctx.options.installer;
        InstallRequest {
            package: self.package_path(),
            validate,
            reboot: true,
            cleanfs: options.cleanfs,
            no_copy: true,
            timeout: options.install_timeout,
        }
    }

    /// Install with validation, falling back once to an unvalidated install
    pub async fn install(&self, device: &mut DeviceHandle) -> Result<InstallOutcome, UpgradeError> {
        let relay = ProgressRelay {
            emitter: self.ctx.emitter.clone(),
        };
        info!("[{}] Installing {} with validation", self.ctx.hostname, self.package_path());

        match device.install(&self.request(true), &relay).await {
            Ok((true, message)) => {
                info!("[{}] Installation completed: {}", self.ctx.hostname, message);
                Ok(InstallOutcome::Installed { message })
            }
            Ok((false, message)) => {
                warn!("[{}] Installation with validation failed: {}", self.ctx.hostname, message);
                self.install_unvalidated(device, &relay).await
            }
            Err(e) => match self.ctx.options.tolerance.classify(&e) {
                InstallErrorClass::LikelySuccessMalformedResponse => self.assume_installed(&e).await,
                InstallErrorClass::RealFailure if e.is_rpc() && mentions_validation(&e) => {
                    warn!("[{}] Validation failed, using fallback: {}", self.ctx.hostname, e);
                    self.install_unvalidated(device, &relay).await
                }
                InstallErrorClass::RealFailure => {
                    error!("[{}] Installation failed: {}", self.ctx.hostname, e);
                    Err(UpgradeError::Installation(e.message()))
                }
            },
        }
    }

    async fn install_unvalidated(
        &self,
        device: &mut DeviceHandle,
        relay: &ProgressRelay,
    ) -> Result<InstallOutcome, UpgradeError> {
        info!("[{}] Installing without package validation", self.ctx.hostname);
        match device.install(&self.request(false), relay).await {
            Ok((true, message)) => {
                info!("[{}] Installation without validation completed: {}", self.ctx.hostname, message);
                Ok(InstallOutcome::InstalledWithoutValidation {
                    message: format!("Installed without package validation (fallback): {}", message),
                })
            }
            Ok((false, message)) => {
                error!("[{}] Installation without validation failed: {}", self.ctx.hostname, message);
                Err(UpgradeError::Installation(message))
            }
            Err(e) => match self.ctx.options.tolerance.classify(&e) {
                InstallErrorClass::LikelySuccessMalformedResponse => self.assume_installed(&e).await,
                InstallErrorClass::RealFailure => {
                    error!("[{}] Installation without validation failed: {}", self.ctx.hostname, e);
                    Err(UpgradeError::Installation(e.message()))
                }
            },
        }
    }

    async fn assume_installed(&self, error: &DeviceError) -> Result<InstallOutcome, UpgradeError> {
        warn!(
            "[{}] Malformed install response, assuming success: {}",
            self.ctx.hostname, error
        );
        self.ctx
            .emitter
            .upgrade_progress(
                UpgradePhase::Installing,
                "software_install",
                StepStatus::Warning,
                None,
                "Install response was malformed; assuming success and waiting for reboot",
            )
            .await;
        tokio::time::sleep(self.ctx.options.installer.assumed_success_pause).await;
        Ok(InstallOutcome::AssumedInstalled {
            message: format!("Installation assumed successful after malformed response: {}", error.message()),
        })
    }

    /// Validate the package without installing it
    pub async fn validate_package(&self, device: &mut DeviceHandle) -> Result<(bool, String), UpgradeError> {
        let args = json!({ "package": self.package_path(), "no_copy": true });
        match device.call(rpc::VALIDATE_PACKAGE, args).await {
            Ok(reply) => {
                let message = reply
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Package validation successful")
                    .to_string();
                info!("[{}] Package validation successful: {}", self.ctx.hostname, message);
                Ok((true, message))
            }
            Err(e) if e.is_rpc() => {
                warn!("[{}] Package validation failed: {}", self.ctx.hostname, e);
                Ok((false, e.message()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn mentions_validation(error: &DeviceError) -> bool {
    let text = error.message().to_lowercase();
    text.contains("validation") || text.contains("package")
}
