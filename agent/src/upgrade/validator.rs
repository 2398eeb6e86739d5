//! Post-upgrade functional validation

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::device::connector::DeviceHandle;
use crate::device::rpc::{self, AlarmInfo, BgpSummary, InterfaceInfo, OspfNeighbors};
use crate::errors::UpgradeError;
use crate::models::status::DeviceBaseline;

/// Aggregated findings; empty means healthy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            "all validations passed".to_string()
        } else {
            self.issues.join("; ")
        }
    }
}

pub struct PostUpgradeValidator<'a> {
    hostname: &'a str,
    baseline: &'a DeviceBaseline,
}

impl<'a> PostUpgradeValidator<'a> {
    pub fn new(hostname: &'a str, baseline: &'a DeviceBaseline) -> Self {
        Self { hostname, baseline }
    }

    /// Connectivity failure is the only error; everything else is an issue
    pub async fn run_all(&self, device: &mut DeviceHandle) -> Result<ValidationReport, UpgradeError> {
        info!("[{}] Running post-upgrade validations", self.hostname);

        device
            .facts()
            .await
            .map_err(|e| UpgradeError::Connection(format!("connectivity validation failed: {}", e.message())))?;

        let mut report = ValidationReport::default();

        match device.call_as::<InterfaceInfo>(rpc::GET_INTERFACES, json!({ "terse": true })).await {
            Ok(interfaces) => {
                let count = interfaces.interfaces.len();
                info!("[{}] {} interfaces detected", self.hostname, count);
                if let Some(before) = self.baseline.interface_count {
                    if count < before {
                        report.issues.push(format!("Interface count decreased: {} -> {}", before, count));
                    }
                }
            }
            Err(e) => warn!("[{}] Interface validation skipped: {}", self.hostname, e),
        }

        match device.call_as::<BgpSummary>(rpc::GET_BGP_SUMMARY, json!({})).await {
            Ok(bgp) if !bgp.peers.is_empty() => {
                let established = bgp.established();
                info!("[{}] BGP: {}/{} peers established", self.hostname, established, bgp.peers.len());
                if established < bgp.peers.len() {
                    report.issues.push(format!(
                        "Not all BGP peers established: {}/{}",
                        established,
                        bgp.peers.len()
                    ));
                }
            }
            Ok(_) => {}
            Err(e) => debug!("[{}] BGP validation skipped: {}", self.hostname, e),
        }

        match device.call_as::<OspfNeighbors>(rpc::GET_OSPF_NEIGHBORS, json!({})).await {
            Ok(ospf) if !ospf.neighbors.is_empty() => {
                let full = ospf.full();
                if full < ospf.neighbors.len() {
                    report.issues.push(format!(
                        "Not all OSPF neighbors Full: {}/{}",
                        full,
                        ospf.neighbors.len()
                    ));
                }
            }
            Ok(_) => {}
            Err(e) => debug!("[{}] OSPF validation skipped: {}", self.hostname, e),
        }

        match device.call_as::<AlarmInfo>(rpc::GET_ALARMS, json!({})).await {
            Ok(alarms) => {
                let critical = alarms.count("critical");
                if critical > 0 {
                    report
                        .issues
                        .push(format!("Critical alarms detected after upgrade: {}", critical));
                }
            }
            Err(e) => debug!("[{}] Alarm validation skipped: {}", self.hostname, e),
        }

        if report.is_healthy() {
            info!("[{}] All post-upgrade validations passed", self.hostname);
        } else {
            warn!(
                "[{}] Post-upgrade validation finished with {} issue(s)",
                self.hostname,
                report.issues.len()
            );
        }
        Ok(report)
    }
}
