//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Directory for daily-rolling log files
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Device session configuration
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Installation configuration
    #[serde(default)]
    pub install: InstallSettings,

    /// Reboot recovery configuration
    #[serde(default)]
    pub reboot: RebootSettings,

    /// Pre-check thresholds
    #[serde(default)]
    pub pre_check: PreCheckSettings,

    /// Event delivery configuration
    #[serde(default)]
    pub events: EventSettings,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// Devices upgraded at the same time
    #[serde(default = "default_max_concurrent_devices")]
    pub max_concurrent_devices: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_devices() -> usize {
    8
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            connection: ConnectionSettings::default(),
            install: InstallSettings::default(),
            reboot: RebootSettings::default(),
            pre_check: PreCheckSettings::default(),
            events: EventSettings::default(),
            mqtt_broker: MqttBrokerSettings::default(),
            max_concurrent_devices: default_max_concurrent_devices(),
        }
    }
}

/// Device session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Attempts to open a session before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// Installation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSettings {
    #[serde(default = "default_install_timeout")]
    pub timeout_secs: u64,

    /// Staging directory on the device
    #[serde(default = "default_package_dir")]
    pub package_dir: String,

    /// Install errors read as a malformed reply to a successful install.
    /// Absent means the built-in list; an empty list disables tolerance.
    #[serde(default)]
    pub malformed_response_signatures: Option<Vec<String>>,
}

fn default_install_timeout() -> u64 {
    1800
}

fn default_package_dir() -> String {
    "/var/tmp".to_string()
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_install_timeout(),
            package_dir: default_package_dir(),
            malformed_response_signatures: None,
        }
    }
}

/// Reboot recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootSettings {
    /// Pause after a reboot request before polling starts
    #[serde(default = "default_initial_reboot_wait")]
    pub initial_wait_secs: u64,

    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Elapsed time after which polling switches to the fast interval
    #[serde(default = "default_adaptive_threshold")]
    pub adaptive_threshold_secs: u64,

    #[serde(default = "default_fast_polling_interval")]
    pub fast_polling_interval_secs: u64,

    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    #[serde(default = "default_stabilization")]
    pub stabilization_secs: u64,
}

fn default_initial_reboot_wait() -> u64 {
    60
}

fn default_max_wait() -> u64 {
    900
}

fn default_polling_interval() -> u64 {
    30
}

fn default_adaptive_threshold() -> u64 {
    300
}

fn default_fast_polling_interval() -> u64 {
    10
}

fn default_status_interval() -> u64 {
    60
}

fn default_stabilization() -> u64 {
    10
}

impl Default for RebootSettings {
    fn default() -> Self {
        Self {
            initial_wait_secs: default_initial_reboot_wait(),
            max_wait_secs: default_max_wait(),
            polling_interval_secs: default_polling_interval(),
            adaptive_threshold_secs: default_adaptive_threshold(),
            fast_polling_interval_secs: default_fast_polling_interval(),
            status_interval_secs: default_status_interval(),
            stabilization_secs: default_stabilization(),
        }
    }
}

/// Pre-check thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreCheckSettings {
    #[serde(default = "default_storage_warning")]
    pub storage_warning_percent: f64,

    #[serde(default = "default_storage_critical")]
    pub storage_critical_percent: f64,

    #[serde(default = "default_min_storage")]
    pub min_storage_mb: f64,

    #[serde(default = "default_temperature_warning")]
    pub temperature_warning_c: f64,

    #[serde(default = "default_temperature_critical")]
    pub temperature_critical_c: f64,

    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
}

fn default_storage_warning() -> f64 {
    85.0
}

fn default_storage_critical() -> f64 {
    95.0
}

fn default_min_storage() -> f64 {
    500.0
}

fn default_temperature_warning() -> f64 {
    70.0
}

fn default_temperature_critical() -> f64 {
    85.0
}

fn default_max_active_sessions() -> usize {
    3
}

impl Default for PreCheckSettings {
    fn default() -> Self {
        Self {
            storage_warning_percent: default_storage_warning(),
            storage_critical_percent: default_storage_critical(),
            min_storage_mb: default_min_storage(),
            temperature_warning_c: default_temperature_warning(),
            temperature_critical_c: default_temperature_critical(),
            max_active_sessions: default_max_active_sessions(),
        }
    }
}

/// Event delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Retries for high-value events
    #[serde(default = "default_event_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_event_retry_delay")]
    pub retry_delay_secs: u64,

    /// Emit JSON_PROGRESS lines on stderr
    #[serde(default = "default_true")]
    pub stderr: bool,

    /// POST every event to this URL
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_event_retry_count() -> u32 {
    3
}

fn default_event_retry_delay() -> u64 {
    2
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            retry_count: default_event_retry_count(),
            retry_delay_secs: default_event_retry_delay(),
            stderr: true,
            webhook_url: None,
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host; empty disables MQTT events
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    8883
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}
