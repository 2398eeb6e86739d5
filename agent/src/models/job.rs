//! Job intake models

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::UpgradeError;
use crate::utils::generate_uuid;

/// What a job asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCommand {
    #[default]
    Upgrade,
    PreCheck,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(host) => vec![host],
        OneOrMany::Many(hosts) => hosts,
    })
}

fn default_port() -> u16 {
    22
}

/// A queued upgrade job
#[derive(Debug, Clone, Deserialize)]
pub struct UpgradeJob {
    /// Job id, generated when absent
    #[serde(default = "generate_uuid")]
    pub job_id: String,

    #[serde(default)]
    pub command: JobCommand,

    /// One or more devices
    #[serde(alias = "hostname", deserialize_with = "one_or_many")]
    pub hostnames: Vec<String>,

    pub username: String,

    #[serde(default)]
    pub password: SecretString,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub target_version: String,

    #[serde(default, alias = "image")]
    pub image_filename: String,

    #[serde(default)]
    pub skip_pre_check: bool,

    #[serde(default)]
    pub force: bool,

    /// Restrict the pre-check battery to these check ids
    #[serde(default)]
    pub selected_checks: Option<Vec<String>>,
}

impl UpgradeJob {
    /// Reject jobs that cannot run
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.hostnames.is_empty() || self.hostnames.iter().any(|h| h.trim().is_empty()) {
            return Err(UpgradeError::ConfigError("job has no hostname".to_string()));
        }
        if self.username.is_empty() {
            return Err(UpgradeError::ConfigError("job has no username".to_string()));
        }
        if self.command == JobCommand::Upgrade {
            if self.target_version.is_empty() {
                return Err(UpgradeError::ConfigError("upgrade job has no target_version".to_string()));
            }
            if self.image_filename.is_empty() {
                return Err(UpgradeError::ConfigError("upgrade job has no image_filename".to_string()));
            }
        }
        Ok(())
    }

    /// Per-device request derived from this job
    pub fn request(&self) -> UpgradeRequest {
        UpgradeRequest {
            command: self.command,
            target_version: self.target_version.clone(),
            image_filename: self.image_filename.clone(),
            skip_pre_check: self.skip_pre_check,
            force: self.force,
            selected_checks: self.selected_checks.clone(),
        }
    }

    pub fn connection(&self, host: &str, connect_timeout: Duration) -> ConnectionParams {
        ConnectionParams {
            host: host.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            port: self.port,
            connect_timeout,
        }
    }
}

/// What to do on one device
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub command: JobCommand,
    pub target_version: String,
    pub image_filename: String,
    pub skip_pre_check: bool,
    pub force: bool,
    pub selected_checks: Option<Vec<String>>,
}

/// Session parameters for one device
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub username: String,
    pub password: SecretString,
    pub port: u16,
    pub connect_timeout: Duration,
}
