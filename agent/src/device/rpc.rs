//! RPC names and typed views of their responses

use serde::{Deserialize, Serialize};

pub const FILE_LIST: &str = "file-list";
pub const GET_SYSTEM_STORAGE: &str = "get-system-storage";
pub const GET_ENVIRONMENT: &str = "get-environment-information";
pub const GET_BGP_SUMMARY: &str = "get-bgp-summary-information";
pub const GET_OSPF_NEIGHBORS: &str = "get-ospf-neighbor-information";
pub const GET_ALARMS: &str = "get-system-alarm-information";
pub const GET_CONFIGURATION_DIFF: &str = "get-configuration-diff";
pub const GET_USERS: &str = "get-system-users-information";
pub const GET_ROLLBACK_INFORMATION: &str = "get-rollback-information";
pub const GET_INTERFACES: &str = "get-interface-information";
pub const GET_UPTIME: &str = "get-system-uptime-information";
pub const SAVE_RESCUE_CONFIGURATION: &str = "request-save-rescue-configuration";
pub const VALIDATE_PACKAGE: &str = "request-package-validate";
pub const PACKAGE_ROLLBACK: &str = "request-package-rollback";
pub const LOAD_CONFIGURATION: &str = "load-configuration";
pub const COMMIT_CONFIGURATION: &str = "commit-configuration";

/// `file-list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub size_bytes: u64,
}

impl FileList {
    pub fn find(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// `get-system-storage`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    #[serde(default)]
    pub filesystems: Vec<Filesystem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filesystem {
    #[serde(default)]
    pub name: String,
    pub mounted_on: String,
    #[serde(default)]
    pub total_mb: f64,
    pub available_mb: f64,
    pub used_percent: f64,
}

impl StorageInfo {
    /// The filesystem holding /var/tmp: `/var` when mounted separately, else `/`
    pub fn staging(&self) -> Option<&Filesystem> {
        self.filesystems
            .iter()
            .find(|fs| fs.mounted_on == "/var")
            .or_else(|| self.filesystems.iter().find(|fs| fs.mounted_on == "/"))
    }
}

/// `get-environment-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    #[serde(default)]
    pub temperatures: Vec<TemperatureSensor>,
    #[serde(default)]
    pub power_supplies: Vec<Component>,
    #[serde(default)]
    pub fans: Vec<Component>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureSensor {
    pub name: String,
    pub celsius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub status: String,
}

impl Component {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok") || self.status.eq_ignore_ascii_case("online")
    }
}

/// `get-bgp-summary-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BgpSummary {
    #[serde(default)]
    pub peers: Vec<BgpPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpPeer {
    pub address: String,
    pub state: String,
}

impl BgpPeer {
    pub fn is_established(&self) -> bool {
        self.state.eq_ignore_ascii_case("established")
    }
}

impl BgpSummary {
    pub fn established(&self) -> usize {
        self.peers.iter().filter(|p| p.is_established()).count()
    }

    pub fn down(&self) -> Vec<&BgpPeer> {
        self.peers.iter().filter(|p| !p.is_established()).collect()
    }
}

/// `get-ospf-neighbor-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OspfNeighbors {
    #[serde(default)]
    pub neighbors: Vec<OspfNeighbor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OspfNeighbor {
    pub address: String,
    pub state: String,
}

impl OspfNeighbors {
    pub fn full(&self) -> usize {
        self.neighbors
            .iter()
            .filter(|n| n.state.eq_ignore_ascii_case("full"))
            .count()
    }
}

/// `get-system-alarm-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmInfo {
    #[serde(default)]
    pub alarms: Vec<Alarm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub class: String,
    pub description: String,
}

impl AlarmInfo {
    pub fn count(&self, class: &str) -> usize {
        self.alarms
            .iter()
            .filter(|a| a.class.eq_ignore_ascii_case(class))
            .count()
    }
}

/// `get-configuration-diff` against the active configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationDiff {
    #[serde(default)]
    pub diff: Option<String>,
}

impl ConfigurationDiff {
    pub fn has_changes(&self) -> bool {
        self.diff.as_deref().is_some_and(|d| !d.trim().is_empty())
    }
}

/// `get-system-users-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersInfo {
    #[serde(default)]
    pub sessions: Vec<UserSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub user: String,
    #[serde(default)]
    pub tty: String,
    #[serde(default)]
    pub from: String,
}

/// `get-rollback-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackInfo {
    #[serde(default)]
    pub rollbacks: Vec<RollbackEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub index: u32,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub user: String,
}

/// `get-interface-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub admin_status: String,
    pub oper_status: String,
}

impl InterfaceInfo {
    /// Interfaces administratively up but operationally down
    pub fn mismatched(&self) -> Vec<&str> {
        self.interfaces
            .iter()
            .filter(|i| {
                i.admin_status.eq_ignore_ascii_case("up") && i.oper_status.eq_ignore_ascii_case("down")
            })
            .map(|i| i.name.as_str())
            .collect()
    }
}

/// `get-system-uptime-information`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UptimeInfo {
    pub uptime_secs: u64,
}
