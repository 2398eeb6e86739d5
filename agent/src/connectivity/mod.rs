//! Two-tier reachability monitoring
//!
//! Tier 1 is a TCP connect to the management port. Tier 2 opens a full
//! management session and waits for a liveness answer. Reboot recovery
//! polls Tier 1 until it passes, then Tier 2, under one overall ceiling.
//! After a reboot request the monitor first sits out an initial wait so a
//! device that has not gone down yet is not mistaken for a recovered one.

pub mod probe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::DeviceTransport;
use crate::errors::UpgradeError;
use crate::models::job::ConnectionParams;
use probe::TcpProber;

/// Connectivity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReachabilityTier {
    Transport,
    Protocol,
}

impl fmt::Display for ReachabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReachabilityTier::Transport => f.write_str("transport"),
            ReachabilityTier::Protocol => f.write_str("protocol"),
        }
    }
}

/// Reachability options
#[derive(Debug, Clone)]
pub struct Options {
    /// Pause between a reboot request and the first poll
    pub initial_reboot_wait: Duration,

    /// Tier 1 connect timeout
    pub tcp_timeout: Duration,

    /// Tier 2 session and liveness timeout
    pub protocol_timeout: Duration,

    /// Ceiling on a reboot wait
    pub max_wait: Duration,

    /// Poll interval before the adaptive threshold
    pub polling_interval: Duration,

    /// Elapsed time after which polling tightens
    pub adaptive_threshold: Duration,

    /// Poll interval after the adaptive threshold
    pub fast_interval: Duration,

    /// Status line cadence
    pub status_interval: Duration,

    /// Pause after Tier 1 passes before trying Tier 2
    pub settle_delay: Duration,

    /// Pause after Tier 2 passes before declaring recovery
    pub stabilization: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            initial_reboot_wait: Duration::from_secs(60),
            tcp_timeout: Duration::from_secs(10),
            protocol_timeout: Duration::from_secs(30),
            max_wait: Duration::from_secs(900),
            polling_interval: Duration::from_secs(30),
            adaptive_threshold: Duration::from_secs(300),
            fast_interval: Duration::from_secs(10),
            status_interval: Duration::from_secs(60),
            settle_delay: Duration::from_secs(5),
            stabilization: Duration::from_secs(10),
        }
    }
}

/// Successful recovery timings
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Total time including stabilization
    pub elapsed: Duration,
    pub transport_after: Duration,
    pub protocol_after: Duration,
}

/// Probes one device
#[derive(Clone)]
pub struct ReachabilityMonitor {
    params: ConnectionParams,
    transport: Arc<dyn DeviceTransport>,
    prober: Arc<dyn TcpProber>,
    options: Options,
}

impl ReachabilityMonitor {
    pub fn new(
        params: ConnectionParams,
        transport: Arc<dyn DeviceTransport>,
        prober: Arc<dyn TcpProber>,
        options: Options,
    ) -> Self {
        Self {
            params,
            transport,
            prober,
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Tier 1
    pub async fn basic_reachable(&self) -> bool {
        self.tcp_probe(self.options.tcp_timeout).await
    }

    /// Tier 2; the error carries a diagnostic
    pub async fn protocol_reachable(&self) -> Result<(), String> {
        self.protocol_probe(self.options.protocol_timeout).await
    }

    /// One attempt at each tier, no waiting
    pub async fn quick_check(&self) -> Result<(), UpgradeError> {
        if !self.basic_reachable().await {
            return Err(UpgradeError::Connection(format!(
                "{} is not accepting TCP connections on port {}",
                self.params.host, self.params.port
            )));
        }
        self.protocol_reachable()
            .await
            .map_err(|diag| UpgradeError::Connection(format!("{}: {}", self.params.host, diag)))
    }

    async fn tcp_probe(&self, timeout: Duration) -> bool {
        self.prober
            .connect(&self.params.host, self.params.port, timeout)
            .await
    }

    async fn protocol_probe(&self, timeout: Duration) -> Result<(), String> {
        let params = ConnectionParams {
            connect_timeout: timeout,
            ..self.params.clone()
        };
        let mut session = match tokio::time::timeout(timeout, self.transport.open(&params)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(format!("session open failed: {}", e)),
            Err(_) => return Err(format!("session open timed out after {:?}", timeout)),
        };

        let probe = tokio::time::timeout(timeout, session.probe()).await;
        if let Err(e) = session.close().await {
            debug!("Closing probe session failed: {}", e);
        }

        match probe {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("liveness probe failed: {}", e)),
            Err(_) => Err(format!("liveness probe timed out after {:?}", timeout)),
        }
    }

    /// Wait for a device that was just asked to reboot
    ///
    /// Sleeps `initial_reboot_wait` first; `max_wait` covers the whole wait
    /// and the returned elapsed time includes the initial pause.
    pub async fn wait_for_reboot(
        &self,
        max_wait: Duration,
        polling_interval: Duration,
    ) -> Result<RecoveryReport, UpgradeError> {
        let initial = self.options.initial_reboot_wait.min(max_wait);
        if !initial.is_zero() {
            info!(
                "Giving {} {}s to go down before polling",
                self.params.host,
                initial.as_secs()
            );
            tokio::time::sleep(initial).await;
        }

        let report = self
            .wait_for_recovery(max_wait - initial, polling_interval)
            .await?;
        Ok(RecoveryReport {
            elapsed: report.elapsed + initial,
            transport_after: report.transport_after + initial,
            protocol_after: report.protocol_after + initial,
        })
    }

    /// Interval to use at `elapsed`
    pub fn interval_at(&self, elapsed: Duration, configured: Duration) -> Duration {
        if elapsed >= self.options.adaptive_threshold {
            configured.min(self.options.fast_interval)
        } else {
            configured
        }
    }

    /// Wait for a rebooting device to clear both tiers
    pub async fn wait_for_recovery(
        &self,
        max_wait: Duration,
        polling_interval: Duration,
    ) -> Result<RecoveryReport, UpgradeError> {
        let host = &self.params.host;
        let start = Instant::now();
        let mut next_status = self.options.status_interval;
        let mut transport_after: Option<Duration> = None;
        let mut last_diagnostic = String::new();

        info!(
            "Waiting up to {:?} for {} to recover (polling every {:?})",
            max_wait, host, polling_interval
        );

        loop {
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                break;
            }

            if elapsed >= next_status {
                let tier = match transport_after {
                    None => ReachabilityTier::Transport,
                    Some(_) => ReachabilityTier::Protocol,
                };
                info!(
                    "Still waiting for {} ({}s elapsed, {}s left, waiting on {} tier)",
                    host,
                    elapsed.as_secs(),
                    (max_wait - elapsed).as_secs(),
                    tier
                );
                while next_status <= elapsed {
                    next_status += self.options.status_interval;
                }
            }

            let remaining = max_wait - elapsed;
            match transport_after {
                None => {
                    if self.tcp_probe(remaining.min(self.options.tcp_timeout)).await {
                        let at = start.elapsed();
                        info!("{} accepting TCP connections after {}s", host, at.as_secs());
                        transport_after = Some(at);
                        self.sleep_within(start, max_wait, self.options.settle_delay).await;
                        continue;
                    }
                }
                Some(transport_at) => {
                    match self
                        .protocol_probe(remaining.min(self.options.protocol_timeout))
                        .await
                    {
                        Ok(()) => {
                            let protocol_at = start.elapsed();
                            info!(
                                "{} management session available after {}s; stabilizing for {:?}",
                                host,
                                protocol_at.as_secs(),
                                self.options.stabilization
                            );
                            tokio::time::sleep(self.options.stabilization).await;
                            return Ok(RecoveryReport {
                                elapsed: start.elapsed(),
                                transport_after: transport_at,
                                protocol_after: protocol_at,
                            });
                        }
                        Err(diag) => {
                            debug!("{} not ready yet: {}", host, diag);
                            last_diagnostic = diag;
                        }
                    }
                }
            }

            let interval = self.interval_at(start.elapsed(), polling_interval);
            self.sleep_within(start, max_wait, interval).await;
        }

        let waited = start.elapsed().as_secs();
        let err = match transport_after {
            None => UpgradeError::RebootTimeout {
                tier: ReachabilityTier::Transport,
                message: format!(
                    "no TCP connectivity to {} after {}s - device may still be booting",
                    host, waited
                ),
            },
            Some(at) => UpgradeError::RebootTimeout {
                tier: ReachabilityTier::Protocol,
                message: format!(
                    "TCP connected after {}s but the management session never became available within {}s ({})",
                    at.as_secs(),
                    waited,
                    last_diagnostic
                ),
            },
        };
        warn!("{}", err);
        Err(err)
    }

    async fn sleep_within(&self, start: Instant, max_wait: Duration, wanted: Duration) {
        let remaining = max_wait.saturating_sub(start.elapsed());
        tokio::time::sleep(wanted.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimBoot, SimScenario, SimulatedTransport};
    use crate::device::DeviceSession;

    fn monitor(sim: &SimulatedTransport) -> ReachabilityMonitor {
        let params = ConnectionParams {
            host: "r1".to_string(),
            username: "admin".to_string(),
            password: "pw".into(),
            port: 22,
            connect_timeout: Duration::from_secs(30),
        };
        ReachabilityMonitor::new(
            params,
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            Options::default(),
        )
    }

    fn sim_with_boot(tcp: u64, protocol: u64, never: bool) -> SimulatedTransport {
        SimulatedTransport::new(SimScenario {
            boot: SimBoot {
                tcp_after_secs: tcp,
                protocol_after_secs: protocol,
                never_recovers: never,
                ..SimBoot::default()
            },
            ..SimScenario::with_version("21.4R3")
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_check_on_healthy_device() {
        let sim = sim_with_boot(10, 40, false);
        assert!(monitor(&sim).quick_check().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_unreachable_while_booting() {
        let sim = sim_with_boot(10, 40, false);
        sim.begin_reboot().await;
        let monitor = monitor(&sim);
        assert!(!monitor.basic_reachable().await);
        assert!(monitor.protocol_reachable().await.is_err());
        assert!(monitor.quick_check().await.is_err());
    }

    #[test]
    fn test_adaptive_interval() {
        let sim = sim_with_boot(10, 40, false);
        let monitor = monitor(&sim);
        let configured = Duration::from_secs(30);
        assert_eq!(monitor.interval_at(Duration::from_secs(299), configured), configured);
        assert_eq!(
            monitor.interval_at(Duration::from_secs(300), configured),
            Duration::from_secs(10)
        );
        // A configured interval already faster than the fast one is kept
        assert_eq!(
            monitor.interval_at(Duration::from_secs(600), Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_timing() {
        let sim = sim_with_boot(10, 40, false);
        sim.begin_reboot().await;

        let report = monitor(&sim)
            .wait_for_recovery(Duration::from_secs(120), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.transport_after, Duration::from_secs(10));
        assert_eq!(report.protocol_after, Duration::from_secs(40));
        assert_eq!(report.elapsed, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_wait_outlasts_slow_shutdown() {
        let sim = SimulatedTransport::new(SimScenario {
            boot: SimBoot {
                tcp_after_secs: 10,
                protocol_after_secs: 40,
                shutdown_after_secs: 30,
                ..SimBoot::default()
            },
            ..SimScenario::with_version("21.4R3")
        });
        let mut session = sim.open(&monitor(&sim).params).await.unwrap();
        session.reboot().await.unwrap();

        let report = monitor(&sim)
            .wait_for_reboot(Duration::from_secs(900), Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(sim.snapshot().await.boots, 1);
        // Down at 30s, sessions again from 70s
        assert!(report.protocol_after >= Duration::from_secs(70));
        assert_eq!(report.transport_after, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_reboot_wait_counts_against_ceiling() {
        let sim = sim_with_boot(10, 40, true);
        sim.begin_reboot().await;

        let start = Instant::now();
        let err = monitor(&sim)
            .wait_for_reboot(Duration::from_secs(120), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(start.elapsed() <= Duration::from_secs(120));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(matches!(err, UpgradeError::RebootTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_recovers_respects_ceiling() {
        let sim = sim_with_boot(10, 40, true);
        sim.begin_reboot().await;

        let start = Instant::now();
        let err = monitor(&sim)
            .wait_for_recovery(Duration::from_secs(120), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(start.elapsed() <= Duration::from_secs(120));
        match err {
            UpgradeError::RebootTimeout { tier, message } => {
                assert_eq!(tier, ReachabilityTier::Transport);
                assert!(message.contains("no TCP connectivity"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_tier_timeout_named() {
        let sim = sim_with_boot(10, 400, false);
        sim.begin_reboot().await;

        let err = monitor(&sim)
            .wait_for_recovery(Duration::from_secs(120), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UpgradeError::RebootTimeout {
                tier: ReachabilityTier::Protocol,
                ..
            }
        ));
    }
}
