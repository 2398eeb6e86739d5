//! Scripted device transport
//!
//! Plays a device from a [`SimScenario`]: canned RPC responses, a queue of
//! installation outcomes, and a boot timeline measured on the tokio clock so
//! reboot waits can run on paused time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::connectivity::probe::TcpProber;
use crate::device::rpc;
use crate::device::{
    DeviceFacts, DeviceSession, DeviceTransport, InstallProgress, InstallReport, InstallRequest,
};
use crate::errors::DeviceError;
use crate::models::job::ConnectionParams;

/// Outcome of one installation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SimInstall {
    /// Device accepts the package
    Ok { message: String },
    /// Device returns a negative verdict
    Fail { message: String },
    /// RPC error with this text
    RpcError { message: String },
    /// No answer at all
    Hang,
}

/// Boot timeline after a reboot starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimBoot {
    /// Seconds until TCP connections are accepted
    pub tcp_after_secs: u64,

    /// Seconds until management sessions open
    pub protocol_after_secs: u64,

    /// The device never comes back
    #[serde(default)]
    pub never_recovers: bool,

    /// Seconds between an accepted reboot and the device going down
    #[serde(default)]
    pub shutdown_after_secs: u64,
}

impl Default for SimBoot {
    fn default() -> Self {
        Self {
            tcp_after_secs: 60,
            protocol_after_secs: 180,
            never_recovers: false,
            shutdown_after_secs: 0,
        }
    }
}

/// Scripted device behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimScenario {
    pub facts: DeviceFacts,

    /// Version reported after a package rollback
    #[serde(default)]
    pub previous_version: Option<String>,

    /// Version reported after a successful install
    #[serde(default)]
    pub installed_version: Option<String>,

    /// RPC name to response
    #[serde(default)]
    pub responses: HashMap<String, Value>,

    /// Responses that replace `responses` once the device has rebooted
    #[serde(default)]
    pub after_reboot_responses: HashMap<String, Value>,

    /// RPC name to error text
    #[serde(default)]
    pub rpc_errors: HashMap<String, String>,

    /// Installation outcomes, consumed in order; success once exhausted
    #[serde(default)]
    pub install_attempts: Vec<SimInstall>,

    /// Progress reports sent during each install
    #[serde(default)]
    pub install_progress: Vec<Value>,

    #[serde(default)]
    pub boot: SimBoot,

    /// Every session open fails with this text
    #[serde(default)]
    pub connect_error: Option<String>,

    /// Reboot requests fail with this text
    #[serde(default)]
    pub reboot_error: Option<String>,
}

impl SimScenario {
    /// A healthy device running `version`
    pub fn with_version(version: &str) -> Self {
        let responses = HashMap::from([
            (
                rpc::FILE_LIST.to_string(),
                json!({"files": [{"name": "junos-install.tgz", "size_bytes": 1_500_000_000u64}]}),
            ),
            (
                rpc::GET_SYSTEM_STORAGE.to_string(),
                json!({"filesystems": [
                    {"name": "/dev/gpt/var", "mounted_on": "/var", "total_mb": 20000.0,
                     "available_mb": 12000.0, "used_percent": 40.0}
                ]}),
            ),
            (
                rpc::GET_ENVIRONMENT.to_string(),
                json!({
                    "temperatures": [{"name": "Routing Engine", "celsius": 41.0}],
                    "power_supplies": [{"name": "PEM 0", "status": "OK"}],
                    "fans": [{"name": "Fan Tray 0", "status": "OK"}]
                }),
            ),
            (
                rpc::GET_BGP_SUMMARY.to_string(),
                json!({"peers": [
                    {"address": "10.0.0.1", "state": "Established"},
                    {"address": "10.0.0.2", "state": "Established"}
                ]}),
            ),
            (
                rpc::GET_OSPF_NEIGHBORS.to_string(),
                json!({"neighbors": [{"address": "10.1.0.1", "state": "Full"}]}),
            ),
            (rpc::GET_ALARMS.to_string(), json!({"alarms": []})),
            (rpc::GET_CONFIGURATION_DIFF.to_string(), json!({"diff": null})),
            (
                rpc::GET_USERS.to_string(),
                json!({"sessions": [{"user": "admin", "tty": "pts/0", "from": "10.9.9.9"}]}),
            ),
            (
                rpc::GET_ROLLBACK_INFORMATION.to_string(),
                json!({"rollbacks": [{"index": 0, "user": "admin"}, {"index": 1, "user": "admin"}]}),
            ),
            (
                rpc::GET_INTERFACES.to_string(),
                json!({"interfaces": [
                    {"name": "ge-0/0/0", "admin_status": "up", "oper_status": "up"},
                    {"name": "ge-0/0/1", "admin_status": "up", "oper_status": "up"}
                ]}),
            ),
            (rpc::GET_UPTIME.to_string(), json!({"uptime_secs": 86_400})),
            (rpc::SAVE_RESCUE_CONFIGURATION.to_string(), json!({"status": "ok"})),
            (rpc::VALIDATE_PACKAGE.to_string(), json!({"message": "package validated"})),
        ]);

        Self {
            facts: DeviceFacts {
                hostname: "sim".to_string(),
                model: "mx204".to_string(),
                version: version.to_string(),
                serial_number: "SIM0001".to_string(),
            },
            responses,
            ..Default::default()
        }
    }
}

/// Observable state, for assertions and reporting
#[derive(Debug, Clone, Default)]
pub struct SimSnapshot {
    pub version: String,
    pub boots: u32,
    pub open_attempts: u32,
    pub sessions_opened: u32,
    pub sessions_closed: u32,
    pub installs: Vec<InstallRequest>,
    pub calls: Vec<String>,
    pub reboot_requests: u32,
}

#[derive(Debug)]
struct SimState {
    version: String,
    staged: Option<String>,
    down_since: Option<Instant>,
    shutdown_at: Option<Instant>,
    boots: u32,
    install_index: usize,
    snapshot: SimSnapshot,
}

impl SimState {
    /// Reboot now, or once `shutdown_after_secs` has passed
    fn request_reboot(&mut self, boot: &SimBoot) {
        if boot.shutdown_after_secs == 0 {
            self.begin_reboot(Instant::now());
        } else {
            self.shutdown_at = Some(Instant::now() + Duration::from_secs(boot.shutdown_after_secs));
        }
    }

    /// Apply a scheduled shutdown whose time has come
    fn advance(&mut self) {
        if let Some(at) = self.shutdown_at {
            if Instant::now() >= at {
                self.shutdown_at = None;
                self.begin_reboot(at);
            }
        }
    }

    fn begin_reboot(&mut self, at: Instant) {
        if let Some(version) = self.staged.take() {
            self.version = version;
        }
        self.down_since = Some(at);
        self.boots += 1;
        self.snapshot.boots = self.boots;
        self.snapshot.version = self.version.clone();
    }

    fn up_after(&self, boot: &SimBoot, secs: u64) -> bool {
        match self.down_since {
            None => true,
            Some(_) if boot.never_recovers => false,
            Some(since) => Instant::now() >= since + Duration::from_secs(secs),
        }
    }
}

/// Transport backed by a scenario
#[derive(Clone)]
pub struct SimulatedTransport {
    scenario: Arc<SimScenario>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    pub fn new(scenario: SimScenario) -> Self {
        let version = scenario.facts.version.clone();
        let state = SimState {
            version: version.clone(),
            staged: None,
            down_since: None,
            shutdown_at: None,
            boots: 0,
            install_index: 0,
            snapshot: SimSnapshot {
                version,
                ..Default::default()
            },
        };
        Self {
            scenario: Arc::new(scenario),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Start a reboot now, as if requested out of band
    pub async fn begin_reboot(&self) {
        self.state.lock().await.begin_reboot(Instant::now());
    }

    pub async fn snapshot(&self) -> SimSnapshot {
        lock(&self.state).await.snapshot.clone()
    }
}

async fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    let mut guard = state.lock().await;
    guard.advance();
    guard
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let mut state = lock(&self.state).await;
        state.snapshot.open_attempts += 1;

        if let Some(err) = &self.scenario.connect_error {
            return Err(DeviceError::Connect(err.clone()));
        }
        if !state.up_after(&self.scenario.boot, self.scenario.boot.protocol_after_secs) {
            return Err(DeviceError::Connect(format!(
                "{}:{}: connection refused",
                params.host, params.port
            )));
        }

        state.snapshot.sessions_opened += 1;
        Ok(Box::new(SimSession {
            scenario: self.scenario.clone(),
            state: self.state.clone(),
            boot: state.boots,
            closed: false,
        }))
    }
}

#[async_trait]
impl TcpProber for SimulatedTransport {
    async fn connect(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
        let state = lock(&self.state).await;
        state.up_after(&self.scenario.boot, self.scenario.boot.tcp_after_secs)
    }
}

struct SimSession {
    scenario: Arc<SimScenario>,
    state: Arc<Mutex<SimState>>,
    boot: u32,
    closed: bool,
}

impl SimSession {
    /// Sessions die with the boot they were opened in
    fn check_alive(&self, state: &SimState) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed("session already closed".to_string()));
        }
        if state.boots != self.boot {
            return Err(DeviceError::Closed("connection lost: device rebooted".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceSession for SimSession {
    async fn facts(&mut self) -> Result<DeviceFacts, DeviceError> {
        let state = lock(&self.state).await;
        self.check_alive(&state)?;
        Ok(DeviceFacts {
            version: state.version.clone(),
            ..self.scenario.facts.clone()
        })
    }

    async fn call(&mut self, name: &str, _args: Value) -> Result<Value, DeviceError> {
        let mut state = lock(&self.state).await;
        self.check_alive(&state)?;
        state.snapshot.calls.push(name.to_string());

        if let Some(err) = self.scenario.rpc_errors.get(name) {
            return Err(DeviceError::Rpc(err.clone()));
        }

        match name {
            rpc::PACKAGE_ROLLBACK => {
                let previous = self
                    .scenario
                    .previous_version
                    .clone()
                    .unwrap_or_else(|| state.version.clone());
                state.staged = Some(previous);
                Ok(json!({"message": "package rollback staged; reboot required"}))
            }
            rpc::LOAD_CONFIGURATION | rpc::COMMIT_CONFIGURATION => Ok(json!({"status": "ok"})),
            _ => {
                let after_reboot = if state.boots > 0 {
                    self.scenario.after_reboot_responses.get(name)
                } else {
                    None
                };
                after_reboot
                    .or_else(|| self.scenario.responses.get(name))
                    .cloned()
                    .ok_or_else(|| DeviceError::Rpc(format!("syntax error: unsupported rpc {}", name)))
            }
        }
    }

    async fn install(
        &mut self,
        request: &InstallRequest,
        progress: &dyn InstallProgress,
    ) -> Result<(bool, String), DeviceError> {
        let attempt = {
            let mut state = lock(&self.state).await;
            self.check_alive(&state)?;
            state.snapshot.installs.push(request.clone());
            let attempt = self.scenario.install_attempts.get(state.install_index).cloned();
            state.install_index += 1;
            attempt
        };

        for report in &self.scenario.install_progress {
            let report = match report {
                Value::Number(n) => InstallReport::Percent(n.as_u64().unwrap_or(0).min(100) as u8),
                Value::String(s) => InstallReport::Text(s.clone()),
                other => InstallReport::Structured(other.clone()),
            };
            progress.report(report).await;
        }

        match attempt {
            None | Some(SimInstall::Ok { .. }) => {
                let message = match attempt {
                    Some(SimInstall::Ok { message }) => message,
                    _ => "Package installed; rebooting".to_string(),
                };
                let mut state = lock(&self.state).await;
                if let Some(version) = &self.scenario.installed_version {
                    state.staged = Some(version.clone());
                }
                if request.reboot {
                    debug!("Simulated device rebooting after install");
                    state.request_reboot(&self.scenario.boot);
                }
                Ok((true, message))
            }
            Some(SimInstall::Fail { message }) => Ok((false, message)),
            Some(SimInstall::RpcError { message }) => Err(DeviceError::Rpc(message)),
            Some(SimInstall::Hang) => {
                tokio::time::sleep(Duration::from_secs(7 * 24 * 3600)).await;
                Err(DeviceError::Closed("install never answered".to_string()))
            }
        }
    }

    async fn reboot(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state).await;
        self.check_alive(&state)?;
        state.snapshot.reboot_requests += 1;
        if let Some(err) = &self.scenario.reboot_error {
            return Err(DeviceError::Rpc(err.clone()));
        }
        state.request_reboot(&self.scenario.boot);
        Ok(())
    }

    async fn probe(&mut self) -> Result<(), DeviceError> {
        let state = lock(&self.state).await;
        self.check_alive(&state)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.closed = true;
            self.state.lock().await.snapshot.sessions_closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ConnectionParams;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "r1".to_string(),
            username: "admin".to_string(),
            password: "pw".into(),
            port: 22,
            connect_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_timeline() {
        let scenario = SimScenario {
            boot: SimBoot {
                tcp_after_secs: 10,
                protocol_after_secs: 40,
                ..SimBoot::default()
            },
            ..SimScenario::with_version("21.4R3")
        };
        let sim = SimulatedTransport::new(scenario);
        sim.begin_reboot().await;

        assert!(!sim.connect("r1", 22, Duration::from_secs(1)).await);
        assert!(sim.open(&params()).await.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sim.connect("r1", 22, Duration::from_secs(1)).await);
        assert!(sim.open(&params()).await.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(sim.open(&params()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_die_on_reboot() {
        let sim = SimulatedTransport::new(SimScenario::with_version("21.4R3"));
        let mut session = sim.open(&params()).await.unwrap();
        assert!(session.probe().await.is_ok());
        session.reboot().await.unwrap();
        assert!(matches!(session.probe().await, Err(DeviceError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_shutdown_keeps_device_up() {
        let scenario = SimScenario {
            boot: SimBoot {
                tcp_after_secs: 10,
                protocol_after_secs: 40,
                shutdown_after_secs: 30,
                ..SimBoot::default()
            },
            ..SimScenario::with_version("21.4R3")
        };
        let sim = SimulatedTransport::new(scenario);
        let mut session = sim.open(&params()).await.unwrap();
        session.reboot().await.unwrap();

        // Accepted but not down yet
        assert!(session.probe().await.is_ok());
        assert!(sim.connect("r1", 22, Duration::from_secs(1)).await);
        assert_eq!(sim.snapshot().await.boots, 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(matches!(session.probe().await, Err(DeviceError::Closed(_))));
        assert!(!sim.connect("r1", 22, Duration::from_secs(1)).await);
        assert_eq!(sim.snapshot().await.boots, 1);

        // Boot timeline counts from the shutdown, not the request
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sim.connect("r1", 22, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_scenario_from_json() {
        let scenario: SimScenario = serde_json::from_value(json!({
            "facts": {"version": "20.4R3"},
            "installed_version": "21.4R3",
            "install_attempts": [{"outcome": "rpc_error", "message": "boom"}]
        }))
        .unwrap();
        assert_eq!(scenario.install_attempts.len(), 1);
        assert_eq!(scenario.boot.tcp_after_secs, 60);
    }
}
