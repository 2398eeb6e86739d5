//! Progress event model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    DeviceProgress,
    UpgradeProgress,
    PreCheckResult,
    PreCheckComplete,
    RollbackProgress,
    RollbackComplete,
    OperationComplete,
}

impl EventType {
    /// Terminal events worth retrying on delivery failure
    pub fn is_high_value(&self) -> bool {
        matches!(
            self,
            EventType::PreCheckComplete | EventType::OperationComplete | EventType::RollbackComplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DeviceProgress => "DEVICE_PROGRESS",
            EventType::UpgradeProgress => "UPGRADE_PROGRESS",
            EventType::PreCheckResult => "PRE_CHECK_RESULT",
            EventType::PreCheckComplete => "PRE_CHECK_COMPLETE",
            EventType::RollbackProgress => "ROLLBACK_PROGRESS",
            EventType::RollbackComplete => "ROLLBACK_COMPLETE",
            EventType::OperationComplete => "OPERATION_COMPLETE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub device: String,
    pub message: String,
    pub data: Value,
}

impl UpgradeEvent {
    pub fn new(
        event_type: EventType,
        job_id: &str,
        device: &str,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            device: device.to_string(),
            message: message.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        let value = serde_json::to_value(EventType::PreCheckComplete).unwrap();
        assert_eq!(value, "PRE_CHECK_COMPLETE");
        assert!(EventType::RollbackComplete.is_high_value());
        assert!(!EventType::DeviceProgress.is_high_value());
    }
}
