//! Error types for the upgrade agent

use std::time::Duration;

use thiserror::Error;

use crate::connectivity::ReachabilityTier;

/// Errors raised by the device transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("{0}")]
    Rpc(String),

    #[error("RPC timeout after {0:?}")]
    Timeout(Duration),

    #[error("Session closed: {0}")]
    Closed(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl DeviceError {
    /// Raw message text without the variant prefix
    pub fn message(&self) -> String {
        match self {
            DeviceError::Connect(msg)
            | DeviceError::Rpc(msg)
            | DeviceError::Closed(msg)
            | DeviceError::Decode(msg) => msg.clone(),
            DeviceError::Timeout(after) => format!("timed out after {:?}", after),
        }
    }

    pub fn is_rpc(&self) -> bool {
        matches!(self, DeviceError::Rpc(_))
    }
}

/// Main error type for the upgrade agent
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("Pre-check failure: {0}")]
    PreCheck(String),

    #[error("Upgrade blocked: {0}")]
    Policy(String),

    #[error("Installation failed: {0}")]
    Installation(String),

    #[error("Reboot timeout ({tier} tier): {message}")]
    RebootTimeout {
        tier: ReachabilityTier,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rollback error: {0}")]
    Rollback(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UpgradeError {
    /// Stable name of the error class, recorded as the terminal error kind
    pub fn kind(&self) -> &'static str {
        match self {
            UpgradeError::Connection(_) => "ConnectionFailure",
            UpgradeError::PreCheck(_) => "PreCheckFailure",
            UpgradeError::Policy(_) => "PolicyViolation",
            UpgradeError::Installation(_) => "InstallationFailure",
            UpgradeError::RebootTimeout { .. } => "RebootTimeoutError",
            UpgradeError::Validation(_) => "ValidationError",
            UpgradeError::Rollback(_) => "RollbackError",
            UpgradeError::Device(DeviceError::Connect(_)) => "ConnectionFailure",
            UpgradeError::Device(DeviceError::Timeout(_)) => "RpcTimeoutError",
            UpgradeError::Device(_) => "RpcError",
            UpgradeError::IoError(_) => "IoError",
            UpgradeError::JsonError(_) => "JsonError",
            UpgradeError::HttpError(_) => "HttpError",
            UpgradeError::MqttError(_) => "MqttError",
            UpgradeError::ConfigError(_) => "ConfigurationError",
            UpgradeError::Internal(_) => "InternalError",
        }
    }

    /// Operator-facing hint for the error class
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            UpgradeError::Connection(_) | UpgradeError::Device(DeviceError::Connect(_)) => {
                Some("Verify management reachability, SSH/NETCONF service and credentials")
            }
            UpgradeError::PreCheck(_) => {
                Some("Resolve the critical pre-check findings or rerun with force")
            }
            UpgradeError::Policy(_) => Some("Confirm the version transition and rerun with force"),
            UpgradeError::Installation(_) => {
                Some("Check the image integrity and free space in /var/tmp")
            }
            UpgradeError::RebootTimeout { .. } => {
                Some("Check the device console; the boot may still be in progress")
            }
            UpgradeError::Rollback(_) => {
                Some("Manual intervention required: verify the running software from the console")
            }
            _ => None,
        }
    }

    /// Message text without the class prefix
    pub fn detail(&self) -> String {
        match self {
            UpgradeError::Connection(msg)
            | UpgradeError::PreCheck(msg)
            | UpgradeError::Policy(msg)
            | UpgradeError::Installation(msg)
            | UpgradeError::Validation(msg)
            | UpgradeError::Rollback(msg)
            | UpgradeError::MqttError(msg)
            | UpgradeError::ConfigError(msg)
            | UpgradeError::Internal(msg) => msg.clone(),
            UpgradeError::RebootTimeout { message, .. } => message.clone(),
            UpgradeError::Device(err) => err.message(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for UpgradeError {
    fn from(err: anyhow::Error) -> Self {
        UpgradeError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(UpgradeError::Connection("x".into()).kind(), "ConnectionFailure");
        assert_eq!(
            UpgradeError::Device(DeviceError::Connect("refused".into())).kind(),
            "ConnectionFailure"
        );
        assert_eq!(
            UpgradeError::Device(DeviceError::Timeout(Duration::from_secs(3))).kind(),
            "RpcTimeoutError"
        );
    }

    #[test]
    fn test_detail_strips_prefix() {
        let err = UpgradeError::Installation("syntax error".into());
        assert_eq!(err.to_string(), "Installation failed: syntax error");
        assert_eq!(err.detail(), "syntax error");

        let err = UpgradeError::Device(DeviceError::Rpc("bad rpc".into()));
        assert_eq!(err.detail(), "bad rpc");
    }
}
