//! The standard pre-check battery

use async_trait::async_trait;
use serde_json::json;

use super::{CheckEnv, PreCheck};
use crate::device::connector::DeviceHandle;
use crate::device::rpc::{self, AlarmInfo, BgpSummary, ConfigurationDiff, EnvironmentInfo, FileList};
use crate::device::rpc::{OspfNeighbors, RollbackInfo, StorageInfo, UsersInfo};
use crate::errors::DeviceError;
use crate::models::precheck::PreCheckResult;
use crate::version::{self, VersionAction};

const MB: f64 = 1024.0 * 1024.0;

/// Every check, in battery order
pub fn standard() -> Vec<Box<dyn PreCheck>> {
    vec![
        Box::new(ImageAvailability),
        Box::new(StorageSpace),
        Box::new(ImageSpace),
        Box::new(HardwareHealth),
        Box::new(BgpStability),
        Box::new(OspfStability),
        Box::new(SystemAlarms),
        Box::new(ConfigCommitted),
        Box::new(ActiveSessions),
        Box::new(BackupAvailability),
        Box::new(VersionCompatibility),
    ]
}

async fn image_size(device: &mut DeviceHandle, env: &CheckEnv) -> Result<Option<u64>, DeviceError> {
    let listing: FileList = device
        .call_as(rpc::FILE_LIST, json!({ "path": env.image_dir }))
        .await?;
    Ok(listing.find(&env.image_filename).map(|f| f.size_bytes))
}

pub struct ImageAvailability;

#[async_trait]
impl PreCheck for ImageAvailability {
    fn id(&self) -> &'static str {
        "image_availability"
    }

    async fn run(&self, device: &mut DeviceHandle, env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let path = env.image_path();
        let Some(size) = image_size(device, env).await? else {
            return Ok(PreCheckResult::critical(self.id(), format!("Image file not found: {}", path))
                .with_details(json!({ "expected_file": env.image_filename }))
                .with_recommendation(format!(
                    "Upload {} to {} on the device before upgrading",
                    env.image_filename, env.image_dir
                )));
        };

        let details = json!({ "image_path": path, "image_size_mb": size as f64 / MB });
        if size < env.thresholds.min_image_bytes {
            return Ok(PreCheckResult::critical(
                self.id(),
                format!("Image file {} is only {} bytes; upload looks truncated", path, size),
            )
            .with_details(details)
            .with_recommendation("Re-upload the image and verify its checksum"));
        }

        Ok(PreCheckResult::pass(
            self.id(),
            format!("Image file verified: {} ({:.1} MB)", env.image_filename, size as f64 / MB),
        )
        .with_details(details))
    }
}

pub struct StorageSpace;

#[async_trait]
impl PreCheck for StorageSpace {
    fn id(&self) -> &'static str {
        "storage_space"
    }

    async fn run(&self, device: &mut DeviceHandle, env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let storage: StorageInfo = device.call_as(rpc::GET_SYSTEM_STORAGE, json!({})).await?;
        let Some(fs) = storage.staging() else {
            return Ok(PreCheckResult::warning(self.id(), "No /var or / filesystem reported")
                .with_recommendation("Manually verify storage with 'show system storage'"));
        };

        let t = &env.thresholds;
        let details = json!({
            "filesystem": fs.name,
            "mounted_on": fs.mounted_on,
            "used_percent": fs.used_percent,
            "available_mb": fs.available_mb,
        });

        let mut problems = Vec::new();
        if fs.used_percent >= t.storage_critical_percent {
            problems.push(format!(
                "{} is {:.0}% used (critical at {:.0}%)",
                fs.mounted_on, fs.used_percent, t.storage_critical_percent
            ));
        }
        if fs.available_mb < t.min_storage_mb {
            problems.push(format!(
                "{} has only {:.1} MB available (minimum {:.0} MB)",
                fs.mounted_on, fs.available_mb, t.min_storage_mb
            ));
        }
        if !problems.is_empty() {
            return Ok(
                PreCheckResult::critical(self.id(), format!("Insufficient storage space: {}", problems.join("; ")))
                    .with_details(details)
                    .with_recommendation("Free up space by removing old files or images from /var/tmp"),
            );
        }

        if fs.used_percent >= t.storage_warning_percent {
            return Ok(PreCheckResult::warning(
                self.id(),
                format!("{} is {:.0}% used", fs.mounted_on, fs.used_percent),
            )
            .with_details(details)
            .with_recommendation("Monitor storage during the upgrade"));
        }

        Ok(PreCheckResult::pass(
            self.id(),
            format!("{} has {:.0} MB available ({:.0}% used)", fs.mounted_on, fs.available_mb, fs.used_percent),
        )
        .with_details(details))
    }
}

pub struct ImageSpace;

#[async_trait]
impl PreCheck for ImageSpace {
    fn id(&self) -> &'static str {
        "image_space"
    }

    async fn run(&self, device: &mut DeviceHandle, env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let Some(size) = image_size(device, env).await? else {
            return Ok(PreCheckResult::info(self.id(), "Image size unknown; space comparison skipped"));
        };
        let storage: StorageInfo = device.call_as(rpc::GET_SYSTEM_STORAGE, json!({})).await?;
        let Some(fs) = storage.staging() else {
            return Ok(PreCheckResult::warning(self.id(), "No staging filesystem reported"));
        };

        let image_mb = size as f64 / MB;
        let wanted_mb = image_mb * env.thresholds.image_space_multiplier;
        let details = json!({
            "image_size_mb": image_mb,
            "available_mb": fs.available_mb,
            "required_mb": wanted_mb,
        });

        if fs.available_mb < image_mb {
            return Ok(PreCheckResult::critical(
                self.id(),
                format!(
                    "Only {:.0} MB free for a {:.0} MB image",
                    fs.available_mb, image_mb
                ),
            )
            .with_details(details)
            .with_recommendation("Run 'request system storage cleanup' and remove unused images"));
        }
        if fs.available_mb < wanted_mb {
            return Ok(PreCheckResult::warning(
                self.id(),
                format!(
                    "{:.0} MB free, {:.0} MB recommended for a {:.0} MB image",
                    fs.available_mb, wanted_mb, image_mb
                ),
            )
            .with_details(details)
            .with_recommendation("Free additional space before installing"));
        }

        Ok(PreCheckResult::pass(
            self.id(),
            format!("{:.0} MB free for a {:.0} MB image", fs.available_mb, image_mb),
        )
        .with_details(details))
    }
}

pub struct HardwareHealth;

#[async_trait]
impl PreCheck for HardwareHealth {
    fn id(&self) -> &'static str {
        "hardware_health"
    }

    async fn run(&self, device: &mut DeviceHandle, env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let info: EnvironmentInfo = match device.call_as(rpc::GET_ENVIRONMENT, json!({})).await {
            Ok(info) => info,
            Err(e) if e.is_rpc() => {
                return Ok(PreCheckResult::warning(
                    self.id(),
                    "Hardware health check unavailable (platform may not support it)",
                )
                .with_details(json!({ "error": e.message() }))
                .with_recommendation("Manually verify hardware status"));
            }
            Err(e) => return Err(e),
        };

        let t = &env.thresholds;
        let max_temp = info
            .temperatures
            .iter()
            .map(|s| s.celsius)
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |m| m.max(c))));
        let psu_ok = info.power_supplies.iter().filter(|p| p.is_ok()).count();
        let fans_ok = info.fans.iter().filter(|f| f.is_ok()).count();

        let details = json!({
            "max_temperature_c": max_temp,
            "power_supplies_ok": psu_ok,
            "power_supplies_total": info.power_supplies.len(),
            "fans_ok": fans_ok,
            "fans_total": info.fans.len(),
        });

        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        for sensor in &info.temperatures {
            if sensor.celsius >= t.temperature_critical_c {
                issues.push(format!("{} at {:.0}C", sensor.name, sensor.celsius));
            } else if sensor.celsius >= t.temperature_warning_c {
                warnings.push(format!("{} elevated at {:.0}C", sensor.name, sensor.celsius));
            }
        }
        for psu in info.power_supplies.iter().filter(|p| !p.is_ok()) {
            issues.push(format!("power supply {} is {}", psu.name, psu.status));
        }
        if psu_ok < t.min_power_supplies {
            issues.push(format!("{} operational power supplies (minimum {})", psu_ok, t.min_power_supplies));
        }
        for fan in info.fans.iter().filter(|f| !f.is_ok()) {
            issues.push(format!("fan {} is {}", fan.name, fan.status));
        }
        if fans_ok < t.min_fans {
            issues.push(format!("{} operational fans (minimum {})", fans_ok, t.min_fans));
        }

        if !issues.is_empty() {
            return Ok(PreCheckResult::critical(
                self.id(),
                format!("Hardware health issues: {}", issues.join("; ")),
            )
            .with_details(details)
            .with_recommendation("Resolve hardware issues before upgrading"));
        }
        if !warnings.is_empty() {
            return Ok(PreCheckResult::warning(self.id(), format!("Hardware warnings: {}", warnings.join("; ")))
                .with_details(details)
                .with_recommendation("Monitor hardware status during the upgrade"));
        }

        Ok(PreCheckResult::pass(
            self.id(),
            format!(
                "Hardware health OK (temp {}, PSU {}/{}, fans {}/{})",
                max_temp.map_or("n/a".to_string(), |c| format!("{:.0}C", c)),
                psu_ok,
                info.power_supplies.len(),
                fans_ok,
                info.fans.len()
            ),
        )
        .with_details(details))
    }
}

pub struct BgpStability;

#[async_trait]
impl PreCheck for BgpStability {
    fn id(&self) -> &'static str {
        "bgp_stability"
    }

    async fn run(&self, device: &mut DeviceHandle, _env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let summary: BgpSummary = match device.call_as(rpc::GET_BGP_SUMMARY, json!({})).await {
            Ok(summary) => summary,
            Err(e) if e.is_rpc() => {
                return Ok(PreCheckResult::info(
                    self.id(),
                    format!("BGP check unavailable (may not be configured): {}", e.message()),
                ));
            }
            Err(e) => return Err(e),
        };

        if summary.peers.is_empty() {
            return Ok(PreCheckResult::info(self.id(), "No BGP peers configured")
                .with_details(json!({ "peer_count": 0 })));
        }

        let details = json!({
            "total_peers": summary.peers.len(),
            "established_peers": summary.established(),
            "peers": summary.peers,
        });
        let down = summary.down();
        if !down.is_empty() {
            let names: Vec<String> = down.iter().map(|p| format!("{} ({})", p.address, p.state)).collect();
            return Ok(PreCheckResult::warning(
                self.id(),
                format!("Some BGP peers not established: {}", names.join(", ")),
            )
            .with_details(details)
            .with_recommendation("Verify BGP peer status to limit routing impact"));
        }

        Ok(PreCheckResult::pass(
            self.id(),
            format!(
                "All BGP peers stable ({}/{} established)",
                summary.established(),
                summary.peers.len()
            ),
        )
        .with_details(details))
    }
}

pub struct OspfStability;

#[async_trait]
impl PreCheck for OspfStability {
    fn id(&self) -> &'static str {
        "ospf_stability"
    }

    async fn run(&self, device: &mut DeviceHandle, _env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let neighbors: OspfNeighbors = match device.call_as(rpc::GET_OSPF_NEIGHBORS, json!({})).await {
            Ok(neighbors) => neighbors,
            Err(e) if e.is_rpc() => {
                return Ok(PreCheckResult::info(
                    self.id(),
                    format!("OSPF check unavailable (may not be configured): {}", e.message()),
                ));
            }
            Err(e) => return Err(e),
        };

        let total = neighbors.neighbors.len();
        if total == 0 {
            return Ok(PreCheckResult::info(self.id(), "No OSPF neighbors"));
        }
        let full = neighbors.full();
        if full < total {
            return Ok(PreCheckResult::warning(
                self.id(),
                format!("{} of {} OSPF neighbors not Full", total - full, total),
            )
            .with_details(json!({ "neighbors": neighbors.neighbors })));
        }
        Ok(PreCheckResult::pass(self.id(), format!("All {} OSPF neighbors Full", total)))
    }
}

pub struct SystemAlarms;

#[async_trait]
impl PreCheck for SystemAlarms {
    fn id(&self) -> &'static str {
        "system_alarms"
    }

    async fn run(&self, device: &mut DeviceHandle, _env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let alarms: AlarmInfo = device.call_as(rpc::GET_ALARMS, json!({})).await?;
        let critical = alarms.count("critical");
        let major = alarms.count("major");
        let minor = alarms.count("minor");
        let details = json!({ "critical": critical, "major": major, "minor": minor, "alarms": alarms.alarms });

        if critical > 0 {
            return Ok(PreCheckResult::critical(self.id(), format!("{} critical system alarm(s) active", critical))
                .with_details(details)
                .with_recommendation("Resolve critical alarms; see 'show system alarms'"));
        }
        if major > 0 {
            return Ok(PreCheckResult::warning(self.id(), format!("{} major system alarm(s) active", major))
                .with_details(details));
        }
        if minor > 0 {
            return Ok(PreCheckResult::info(self.id(), format!("{} minor system alarm(s) active", minor))
                .with_details(details));
        }
        Ok(PreCheckResult::pass(self.id(), "No active system alarms"))
    }
}

pub struct ConfigCommitted;

#[async_trait]
impl PreCheck for ConfigCommitted {
    fn id(&self) -> &'static str {
        "config_committed"
    }

    async fn run(&self, device: &mut DeviceHandle, _env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let diff: ConfigurationDiff = match device
            .call_as(rpc::GET_CONFIGURATION_DIFF, json!({ "compare": "rollback", "rollback": 0 }))
            .await
        {
            Ok(diff) => diff,
            Err(e) if e.is_rpc() => {
                return Ok(PreCheckResult::warning(
                    self.id(),
                    format!("Unable to read candidate configuration: {}", e.message()),
                )
                .with_recommendation("Manually verify there are no uncommitted changes"));
            }
            Err(e) => return Err(e),
        };

        if diff.has_changes() {
            return Ok(PreCheckResult::critical(self.id(), "Uncommitted configuration changes present")
                .with_details(json!({ "diff": diff.diff }))
                .with_recommendation("Commit or roll back pending changes before upgrading"));
        }
        Ok(PreCheckResult::pass(self.id(), "Configuration is committed"))
    }
}

pub struct ActiveSessions;

#[async_trait]
impl PreCheck for ActiveSessions {
    fn id(&self) -> &'static str {
        "active_sessions"
    }

    async fn run(&self, device: &mut DeviceHandle, env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let users: UsersInfo = device.call_as(rpc::GET_USERS, json!({})).await?;
        let count = users.sessions.len();
        let details = json!({ "sessions": users.sessions });

        if count > env.thresholds.max_active_sessions {
            return Ok(PreCheckResult::warning(self.id(), format!("{} active user sessions", count))
                .with_details(details)
                .with_recommendation("Notify logged-in users before the reboot"));
        }
        Ok(PreCheckResult::info(self.id(), format!("{} active user session(s)", count)).with_details(details))
    }
}

pub struct BackupAvailability;

#[async_trait]
impl PreCheck for BackupAvailability {
    fn id(&self) -> &'static str {
        "backup_availability"
    }

    async fn run(&self, device: &mut DeviceHandle, _env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        let info: RollbackInfo = device.call_as(rpc::GET_ROLLBACK_INFORMATION, json!({})).await?;
        if info.rollbacks.is_empty() {
            return Ok(PreCheckResult::warning(self.id(), "No configuration rollback generations available")
                .with_recommendation("Commit the configuration once to create a rollback point"));
        }
        Ok(PreCheckResult::pass(
            self.id(),
            format!("{} configuration rollback generation(s) available", info.rollbacks.len()),
        ))
    }
}

pub struct VersionCompatibility;

#[async_trait]
impl PreCheck for VersionCompatibility {
    fn id(&self) -> &'static str {
        "version_compatibility"
    }

    async fn run(&self, _device: &mut DeviceHandle, env: &CheckEnv) -> Result<PreCheckResult, DeviceError> {
        if env.target_version.is_empty() {
            return Ok(PreCheckResult::info(self.id(), "No target version given"));
        }
        let current = version::parse(&env.current_version);
        let target = version::parse(&env.target_version);
        let action = version::compare_tuples(&current, &target);
        let details = json!({
            "current": env.current_version,
            "target": env.target_version,
            "action": action,
            "risk": version::risk(action),
        });

        if action == VersionAction::Unknown {
            return Ok(PreCheckResult::warning(
                self.id(),
                format!(
                    "Unable to compare versions {} and {}",
                    env.current_version, env.target_version
                ),
            )
            .with_details(details));
        }
        if let Some(note) = version::compatibility_note(&current, &target) {
            return Ok(PreCheckResult::warning(self.id(), note)
                .with_details(details)
                .with_recommendation("Check the release notes for a supported upgrade path"));
        }
        if action == VersionAction::SameVersion {
            return Ok(PreCheckResult::info(self.id(), "Device already runs the target version").with_details(details));
        }
        Ok(PreCheckResult::pass(
            self.id(),
            format!("{} -> {} ({})", env.current_version, env.target_version, action),
        )
        .with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::connector::{DeviceConnector, Options};
    use crate::device::sim::{SimScenario, SimulatedTransport};
    use crate::models::job::ConnectionParams;
    use crate::models::precheck::CheckSeverity;
    use crate::precheck::Thresholds;
    use std::sync::Arc;
    use std::time::Duration;

    fn env() -> CheckEnv {
        CheckEnv {
            hostname: "r1".to_string(),
            image_filename: "junos-install.tgz".to_string(),
            image_dir: "/var/tmp".to_string(),
            current_version: "20.4R3".to_string(),
            target_version: "21.4R3".to_string(),
            thresholds: Thresholds::default(),
        }
    }

    async fn handle(scenario: SimScenario) -> DeviceHandle {
        let params = ConnectionParams {
            host: "r1".to_string(),
            username: "admin".to_string(),
            password: "pw".into(),
            port: 22,
            connect_timeout: Duration::from_secs(30),
        };
        DeviceConnector::new(Arc::new(SimulatedTransport::new(scenario)), params, Options::default())
            .connect()
            .await
            .unwrap()
    }

    fn with_response(rpc_name: &str, value: serde_json::Value) -> SimScenario {
        let mut scenario = SimScenario::with_version("20.4R3");
        scenario.responses.insert(rpc_name.to_string(), value);
        scenario
    }

    #[tokio::test]
    async fn test_healthy_device_passes_battery() {
        let mut device = handle(SimScenario::with_version("20.4R3")).await;
        for check in standard() {
            let result = check.run(&mut device, &env()).await.unwrap();
            assert!(!result.is_critical_failure(), "{} failed: {}", result.check_name, result.message);
        }
    }

    #[tokio::test]
    async fn test_missing_image_is_critical() {
        let mut device = handle(with_response(rpc::FILE_LIST, json!({"files": []}))).await;
        let result = ImageAvailability.run(&mut device, &env()).await.unwrap();
        assert!(result.is_critical_failure());
        assert!(result.message.contains("/var/tmp/junos-install.tgz"));
    }

    #[tokio::test]
    async fn test_storage_thresholds() {
        let storage = |used: f64, avail: f64| {
            json!({"filesystems": [{"mounted_on": "/var", "available_mb": avail, "used_percent": used}]})
        };

        let mut device = handle(with_response(rpc::GET_SYSTEM_STORAGE, storage(95.0, 5000.0))).await;
        assert_eq!(StorageSpace.run(&mut device, &env()).await.unwrap().severity, CheckSeverity::Critical);

        let mut device = handle(with_response(rpc::GET_SYSTEM_STORAGE, storage(50.0, 400.0))).await;
        assert_eq!(StorageSpace.run(&mut device, &env()).await.unwrap().severity, CheckSeverity::Critical);

        let mut device = handle(with_response(rpc::GET_SYSTEM_STORAGE, storage(85.0, 5000.0))).await;
        assert_eq!(StorageSpace.run(&mut device, &env()).await.unwrap().severity, CheckSeverity::Warning);
    }

    #[tokio::test]
    async fn test_image_space_ratio() {
        // 1.5e9 bytes is about 1430 MB; 2000 MB free is under 2.2x
        let storage = json!({"filesystems": [{"mounted_on": "/var", "available_mb": 2000.0, "used_percent": 50.0}]});
        let mut device = handle(with_response(rpc::GET_SYSTEM_STORAGE, storage)).await;
        let result = ImageSpace.run(&mut device, &env()).await.unwrap();
        assert_eq!(result.severity, CheckSeverity::Warning);

        let storage = json!({"filesystems": [{"mounted_on": "/var", "available_mb": 1000.0, "used_percent": 50.0}]});
        let mut device = handle(with_response(rpc::GET_SYSTEM_STORAGE, storage)).await;
        let result = ImageSpace.run(&mut device, &env()).await.unwrap();
        assert!(result.is_critical_failure());
    }

    #[tokio::test]
    async fn test_hardware_unsupported_is_warning() {
        let mut scenario = SimScenario::with_version("20.4R3");
        scenario
            .rpc_errors
            .insert(rpc::GET_ENVIRONMENT.to_string(), "syntax error".to_string());
        let mut device = handle(scenario).await;
        let result = HardwareHealth.run(&mut device, &env()).await.unwrap();
        assert_eq!(result.severity, CheckSeverity::Warning);
    }

    #[tokio::test]
    async fn test_hot_chassis_is_critical() {
        let environment = json!({
            "temperatures": [{"name": "FPC 0", "celsius": 88.0}],
            "power_supplies": [{"name": "PEM 0", "status": "OK"}],
            "fans": [{"name": "Fan 0", "status": "OK"}]
        });
        let mut device = handle(with_response(rpc::GET_ENVIRONMENT, environment)).await;
        let result = HardwareHealth.run(&mut device, &env()).await.unwrap();
        assert!(result.is_critical_failure());
    }

    #[tokio::test]
    async fn test_bgp_peer_down_is_warning() {
        let peers = json!({"peers": [
            {"address": "10.0.0.1", "state": "Established"},
            {"address": "10.0.0.2", "state": "Active"}
        ]});
        let mut device = handle(with_response(rpc::GET_BGP_SUMMARY, peers)).await;
        let result = BgpStability.run(&mut device, &env()).await.unwrap();
        assert_eq!(result.severity, CheckSeverity::Warning);
        assert!(result.message.contains("10.0.0.2 (Active)"));
    }

    #[tokio::test]
    async fn test_alarm_classes() {
        let alarms = json!({"alarms": [{"class": "Major", "description": "PEM 1 absent"}]});
        let mut device = handle(with_response(rpc::GET_ALARMS, alarms)).await;
        assert_eq!(SystemAlarms.run(&mut device, &env()).await.unwrap().severity, CheckSeverity::Warning);

        let alarms = json!({"alarms": [{"class": "Critical", "description": "FPC 0 offline"}]});
        let mut device = handle(with_response(rpc::GET_ALARMS, alarms)).await;
        assert!(SystemAlarms.run(&mut device, &env()).await.unwrap().is_critical_failure());
    }

    #[tokio::test]
    async fn test_uncommitted_changes_block() {
        let diff = json!({"diff": "[edit system]\n+  host-name r1-new;"});
        let mut device = handle(with_response(rpc::GET_CONFIGURATION_DIFF, diff)).await;
        assert!(ConfigCommitted.run(&mut device, &env()).await.unwrap().is_critical_failure());
    }

    #[tokio::test]
    async fn test_version_gap_warns() {
        let mut device = handle(SimScenario::with_version("18.4R3")).await;
        let env = CheckEnv {
            current_version: "18.4R3".to_string(),
            ..env()
        };
        let result = VersionCompatibility.run(&mut device, &env).await.unwrap();
        assert_eq!(result.severity, CheckSeverity::Warning);
    }
}
