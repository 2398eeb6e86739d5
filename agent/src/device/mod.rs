//! Remote device capability
//!
//! The wire protocol lives outside this crate. A transport opens sessions;
//! a session executes named RPCs, installs packages and reboots. Every call
//! made by the upgrade pipeline goes through [`connector::DeviceHandle`],
//! which bounds it with a timeout.

pub mod connector;
pub mod rpc;
pub mod sim;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DeviceError;
use crate::models::job::ConnectionParams;

/// Basic facts reported by a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFacts {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub model: String,
    pub version: String,
    #[serde(default)]
    pub serial_number: String,
}

/// Package installation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallRequest {
    /// Package path on the device
    pub package: String,
    pub validate: bool,
    pub reboot: bool,
    pub cleanfs: bool,
    pub no_copy: bool,
    pub timeout: Duration,
}

/// Progress report produced during installation
#[derive(Debug, Clone, PartialEq)]
pub enum InstallReport {
    Percent(u8),
    Text(String),
    Structured(Value),
}

/// Receives installation progress
#[async_trait]
pub trait InstallProgress: Send + Sync {
    async fn report(&self, report: InstallReport);
}

/// Open session to one device
#[async_trait]
pub trait DeviceSession: Send {
    /// Read device facts
    async fn facts(&mut self) -> Result<DeviceFacts, DeviceError>;

    /// Execute a named RPC
    async fn call(&mut self, rpc: &str, args: Value) -> Result<Value, DeviceError>;

    /// Install a package; returns the device's verdict and message
    async fn install(
        &mut self,
        request: &InstallRequest,
        progress: &dyn InstallProgress,
    ) -> Result<(bool, String), DeviceError>;

    /// Request a reboot
    async fn reboot(&mut self) -> Result<(), DeviceError>;

    /// Liveness probe
    async fn probe(&mut self) -> Result<(), DeviceError>;

    /// Close the session
    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Opens sessions to devices
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn DeviceSession>, DeviceError>;
}
