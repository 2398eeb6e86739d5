//! Data models

pub mod event;
pub mod job;
pub mod precheck;
pub mod result;
pub mod status;
