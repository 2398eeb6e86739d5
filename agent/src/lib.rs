//! Upgrade Agent Library
//!
//! Firmware upgrade orchestration for network devices: pre-checks, package
//! installation, reboot recovery, verification and rollback, with progress
//! streamed as structured events.

pub mod app;
pub mod connectivity;
pub mod device;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod mqtt;
pub mod precheck;
pub mod progress;
pub mod storage;
pub mod upgrade;
pub mod utils;
pub mod version;
pub mod workers;
