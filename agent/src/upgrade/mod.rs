//! Upgrade orchestration
//!
//! [`upgrader::DeviceUpgrader`] composes the pre-check engine, installer,
//! reachability monitor, validator and rollback manager into one phase
//! machine per device.

pub mod context;
pub mod installer;
pub mod phase;
pub mod rollback;
pub mod upgrader;
pub mod validator;
