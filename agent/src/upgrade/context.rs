//! Per-run context handed to every component of one device pipeline

use std::sync::Arc;

use crate::app::options::UpgradeOptions;
use crate::progress::emitter::EventEmitter;

#[derive(Clone)]
pub struct RunContext {
    pub job_id: String,
    pub hostname: String,
    pub options: Arc<UpgradeOptions>,
    pub emitter: EventEmitter,
}

impl RunContext {
    pub fn new(job_id: &str, hostname: &str, options: Arc<UpgradeOptions>, emitter: EventEmitter) -> Self {
        Self {
            job_id: job_id.to_string(),
            hostname: hostname.to_string(),
            options,
            emitter,
        }
    }
}
