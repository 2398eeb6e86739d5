//! Session acquisition with retry, per-call timeouts and scoped release

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::device::{DeviceFacts, DeviceSession, DeviceTransport, InstallProgress, InstallRequest};
use crate::errors::{DeviceError, UpgradeError};
use crate::models::job::ConnectionParams;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Connection options
#[derive(Debug, Clone)]
pub struct Options {
    /// Timeout for opening a session
    pub connect_timeout: Duration,

    /// Timeout for a single RPC
    pub operation_timeout: Duration,

    /// Attempts to open a session before giving up
    pub connect_attempts: u32,

    /// Backoff between attempts
    pub connect_backoff: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(300),
            connect_attempts: 3,
            connect_backoff: CooldownOptions::doubling(Duration::from_secs(2), Duration::from_secs(30)),
        }
    }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(DeviceError::Timeout(limit)))
}

/// An open session whose every operation is bounded by a timeout
pub struct DeviceHandle {
    host: String,
    session: Box<dyn DeviceSession>,
    operation_timeout: Duration,
}

impl DeviceHandle {
    pub fn new(host: &str, session: Box<dyn DeviceSession>, operation_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            session,
            operation_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn facts(&mut self) -> Result<DeviceFacts, DeviceError> {
        bounded(self.operation_timeout, self.session.facts()).await
    }

    pub async fn call(&mut self, rpc: &str, args: Value) -> Result<Value, DeviceError> {
        debug!("RPC {} on {}", rpc, self.host);
        bounded(self.operation_timeout, self.session.call(rpc, args)).await
    }

    /// Call an RPC and decode its response
    pub async fn call_as<T: DeserializeOwned>(&mut self, rpc: &str, args: Value) -> Result<T, DeviceError> {
        let value = self.call(rpc, args).await?;
        serde_json::from_value(value).map_err(|e| DeviceError::Decode(format!("{}: {}", rpc, e)))
    }

    /// Install, bounded by the request's own timeout
    pub async fn install(
        &mut self,
        request: &InstallRequest,
        progress: &dyn InstallProgress,
    ) -> Result<(bool, String), DeviceError> {
        bounded(request.timeout, self.session.install(request, progress)).await
    }

    pub async fn reboot(&mut self) -> Result<(), DeviceError> {
        bounded(self.operation_timeout, self.session.reboot()).await
    }

    pub async fn probe(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        bounded(timeout, self.session.probe()).await
    }

    /// Close the session. Errors are logged; the session is gone either way.
    pub async fn close(mut self) {
        match bounded(self.operation_timeout, self.session.close()).await {
            Ok(()) => debug!("Session to {} closed", self.host),
            Err(e) => debug!("Closing session to {} failed: {}", self.host, e),
        }
    }
}

/// Opens sessions to one device
#[derive(Clone)]
pub struct DeviceConnector {
    transport: Arc<dyn DeviceTransport>,
    params: ConnectionParams,
    options: Options,
}

impl DeviceConnector {
    pub fn new(transport: Arc<dyn DeviceTransport>, params: ConnectionParams, options: Options) -> Self {
        Self {
            transport,
            params,
            options,
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Open a session, retrying transient failures with exponential backoff
    pub async fn connect(&self) -> Result<DeviceHandle, UpgradeError> {
        let attempts = self.options.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let opened = bounded(self.options.connect_timeout, self.transport.open(&self.params)).await;
            match opened {
                Ok(session) => {
                    info!("Connected to {}:{}", self.params.host, self.params.port);
                    return Ok(DeviceHandle::new(
                        &self.params.host,
                        session,
                        self.options.operation_timeout,
                    ));
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        attempts,
                        self.params.host,
                        e
                    );
                    last_error = e.message();
                    if attempt + 1 < attempts {
                        tokio::time::sleep(calc_exp_backoff(&self.options.connect_backoff, attempt)).await;
                    }
                }
            }
        }

        Err(UpgradeError::Connection(format!(
            "unable to connect to {} after {} attempt(s): {}",
            self.params.host, attempts, last_error
        )))
    }
}

/// Holds at most one session for a run and releases it on demand
pub struct SessionSlot {
    connector: DeviceConnector,
    handle: Option<DeviceHandle>,
}

impl SessionSlot {
    pub fn new(connector: DeviceConnector) -> Self {
        Self {
            connector,
            handle: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// The open session, connecting first if needed
    pub async fn acquire(&mut self) -> Result<&mut DeviceHandle, UpgradeError> {
        if self.handle.is_none() {
            let handle = self.connector.connect().await?;
            self.handle = Some(handle);
        }
        self.handle
            .as_mut()
            .ok_or_else(|| UpgradeError::Internal("session slot empty after connect".to_string()))
    }

    /// Close the session if one is open
    pub async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
    }
}

/// A slot dropped while still holding a session (a panicking run) hands the
/// close to the runtime
impl Drop for SessionSlot {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Session to {} dropped while open; closing in background", handle.host);
                runtime.spawn(handle.close());
            }
            Err(_) => warn!("Session to {} dropped outside a runtime; left open", handle.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimScenario, SimulatedTransport};

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
    async fn test_connect_retries_then_fails() {
        let scenario = SimScenario {
            connect_error: Some("authentication failed".to_string()),
            ..SimScenario::with_version("21.4R3")
        };
        let sim = SimulatedTransport::new(scenario);
        let connector = DeviceConnector::new(Arc::new(sim.clone()), params(), Options::default());

        let err = connector.connect().await.err().unwrap();
        assert_eq!(err.kind(), "ConnectionFailure");
        assert!(err.to_string().contains("authentication failed"));
        assert_eq!(sim.snapshot().await.open_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_releases_session() {
        let sim = SimulatedTransport::new(SimScenario::with_version("21.4R3"));
        let connector = DeviceConnector::new(Arc::new(sim.clone()), params(), Options::default());
        let mut slot = SessionSlot::new(connector);

        let facts = slot.acquire().await.unwrap().facts().await.unwrap();
        assert_eq!(facts.version, "21.4R3");
        assert!(slot.is_open());

        slot.release().await;
        assert!(!slot.is_open());
        let snapshot = sim.snapshot().await;
        assert_eq!(snapshot.sessions_opened, snapshot.sessions_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_closes_session_when_task_panics() {
        let sim = SimulatedTransport::new(SimScenario::with_version("21.4R3"));
        let connector = DeviceConnector::new(Arc::new(sim.clone()), params(), Options::default());

        let task = tokio::spawn(async move {
            let mut slot = SessionSlot::new(connector);
            slot.acquire().await.unwrap();
            panic!("pipeline bug");
        });
        assert!(task.await.unwrap_err().is_panic());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = sim.snapshot().await;
        assert_eq!(snapshot.sessions_opened, 1);
        assert_eq!(snapshot.sessions_closed, 1);
    }
}
