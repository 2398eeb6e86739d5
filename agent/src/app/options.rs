//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::connectivity;
use crate::device::connector;
use crate::errors::UpgradeError;
use crate::logs::LogOptions;
use crate::mqtt::client::MqttAddress;
use crate::precheck::Thresholds;
use crate::progress::emitter;
use crate::storage::settings::Settings;
use crate::upgrade::installer::{self, ResponseTolerancePolicy};
use crate::version::RiskTable;
use crate::workers::mqtt;

/// Everything one device pipeline needs to know
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Session opening and per-call timeouts
    pub connection: connector::Options,

    /// Reboot recovery polling
    pub reachability: connectivity::Options,

    /// Pre-check thresholds
    pub thresholds: Thresholds,

    /// Package installation
    pub installer: installer::Options,

    /// Install errors read as success
    pub tolerance: ResponseTolerancePolicy,

    /// Version transition risk
    pub risk_table: RiskTable,

    /// Event delivery retries
    pub events: emitter::Options,
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub log: LogOptions,

    pub upgrade: UpgradeOptions,

    /// Devices upgraded at the same time
    pub max_concurrent_devices: usize,

    /// Emit JSON_PROGRESS lines on stderr
    pub stderr_events: bool,

    /// MQTT worker and event sink
    pub mqtt_worker: mqtt::Options,

    /// Webhook event sink
    pub webhook_url: Option<Url>,

    /// Webhook request timeout
    pub webhook_timeout: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            log: LogOptions::default(),
            upgrade: UpgradeOptions::default(),
            max_concurrent_devices: 8,
            stderr_events: true,
            mqtt_worker: mqtt::Options::default(),
            webhook_url: None,
            webhook_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentOptions {
    /// Build options from a settings file
    pub fn from_settings(settings: &Settings) -> Result<Self, UpgradeError> {
        let defaults = Self::default();

        let webhook_url = match settings.events.webhook_url.as_deref() {
            None | Some("") => None,
            Some(raw) => {
                let url = Url::parse(raw)
                    .map_err(|e| UpgradeError::ConfigError(format!("invalid webhook URL {}: {}", raw, e)))?;
                Some(url)
            }
        };

        let tolerance = match &settings.install.malformed_response_signatures {
            Some(signatures) => ResponseTolerancePolicy::new(signatures.clone()),
            None => ResponseTolerancePolicy::default(),
        };

        let connection = connector::Options {
            connect_timeout: Duration::from_secs(settings.connection.connect_timeout_secs),
            operation_timeout: Duration::from_secs(settings.connection.operation_timeout_secs),
            connect_attempts: settings.connection.retry_attempts.max(1),
            ..defaults.upgrade.connection
        };

        let reboot = &settings.reboot;
        let reachability = connectivity::Options {
            initial_reboot_wait: Duration::from_secs(reboot.initial_wait_secs),
            max_wait: Duration::from_secs(reboot.max_wait_secs),
            polling_interval: Duration::from_secs(reboot.polling_interval_secs.max(1)),
            adaptive_threshold: Duration::from_secs(reboot.adaptive_threshold_secs),
            fast_interval: Duration::from_secs(reboot.fast_polling_interval_secs.max(1)),
            status_interval: Duration::from_secs(reboot.status_interval_secs.max(1)),
            stabilization: Duration::from_secs(reboot.stabilization_secs),
            ..defaults.upgrade.reachability
        };

        let checks = &settings.pre_check;
        let thresholds = Thresholds {
            storage_warning_percent: checks.storage_warning_percent,
            storage_critical_percent: checks.storage_critical_percent,
            min_storage_mb: checks.min_storage_mb,
            temperature_warning_c: checks.temperature_warning_c,
            temperature_critical_c: checks.temperature_critical_c,
            max_active_sessions: checks.max_active_sessions,
            ..defaults.upgrade.thresholds
        };

        let installer = installer::Options {
            package_dir: settings.install.package_dir.clone(),
            install_timeout: Duration::from_secs(settings.install.timeout_secs),
            ..defaults.upgrade.installer
        };

        let events = emitter::Options {
            retry_count: settings.events.retry_count,
            retry_delay: Duration::from_secs(settings.events.retry_delay_secs),
        };

        let broker = &settings.mqtt_broker;
        let mqtt_worker = mqtt::Options {
            broker_address: MqttAddress {
                host: broker.host.clone(),
                port: broker.port,
                use_tls: broker.tls,
                ca_cert_path: broker.ca_cert_path.clone(),
                username: broker.username.clone(),
                password: broker.password.clone(),
            },
            ..defaults.mqtt_worker
        };

        Ok(Self {
            log: LogOptions {
                log_level: settings.log_level.clone(),
                json_format: settings.log_json,
                log_dir: settings.log_dir.as_ref().map(PathBuf::from),
                ..defaults.log
            },
            upgrade: UpgradeOptions {
                connection,
                reachability,
                thresholds,
                installer,
                tolerance,
                risk_table: RiskTable::default(),
                events,
            },
            max_concurrent_devices: settings.max_concurrent_devices.max(1),
            stderr_events: settings.events.stderr,
            mqtt_worker,
            webhook_url,
            webhook_timeout: defaults.webhook_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_settings_defaults() {
        let options = AgentOptions::from_settings(&Settings::default()).unwrap();
        assert_eq!(options.upgrade.connection.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.upgrade.installer.install_timeout, Duration::from_secs(1800));
        assert_eq!(options.upgrade.reachability.max_wait, Duration::from_secs(900));
        assert_eq!(options.upgrade.reachability.initial_reboot_wait, Duration::from_secs(60));
        assert_eq!(options.upgrade.reachability.fast_interval, Duration::from_secs(10));
        assert_eq!(options.upgrade.events.retry_delay, Duration::from_secs(2));
        assert_eq!(options.upgrade.tolerance.signatures().len(), 6);
        assert_eq!(options.max_concurrent_devices, 8);
        assert!(options.webhook_url.is_none());
    }

    #[test]
    fn test_empty_signature_list_disables_tolerance() {
        let mut settings = Settings::default();
        settings.install.malformed_response_signatures = Some(vec![]);
        let options = AgentOptions::from_settings(&settings).unwrap();
        assert!(options.upgrade.tolerance.signatures().is_empty());
    }

    #[test]
    fn test_invalid_webhook_rejected() {
        let mut settings = Settings::default();
        settings.events.webhook_url = Some("not a url".to_string());
        let err = AgentOptions::from_settings(&settings).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }
}
