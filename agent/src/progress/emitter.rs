//! Typed progress events with bounded delivery retry

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::models::event::{EventType, UpgradeEvent};
use crate::models::precheck::{PreCheckResult, PreCheckSummary};
use crate::models::result::{RollbackKind, StepStatus};
use crate::models::status::DeviceStatus;
use crate::precheck::CheckObserver;
use crate::progress::sink::EventSink;
use crate::upgrade::phase::UpgradePhase;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Delivery options
#[derive(Debug, Clone)]
pub struct Options {
    /// Retries after the first attempt, high-value events only
    pub retry_count: u32,

    /// Base delay between retries
    pub retry_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Emits events for one device of one job
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    options: Options,
    job_id: String,
    device: String,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>, options: Options, job_id: &str, device: &str) -> Self {
        Self {
            sink,
            options,
            job_id: job_id.to_string(),
            device: device.to_string(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Deliver one event. Never fails the caller; returns whether it arrived.
    pub async fn emit(&self, event_type: EventType, message: impl Into<String>, data: Value) -> bool {
        let event = UpgradeEvent::new(event_type, &self.job_id, &self.device, message, data);

        if !event_type.is_high_value() {
            return match self.sink.emit(&event).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("[{}] Dropped {} event: {}", self.device, event_type, e);
                    false
                }
            };
        }

        let base_delay = if event_type == EventType::OperationComplete {
            self.options.retry_delay * 2
        } else {
            self.options.retry_delay
        };
        let backoff = CooldownOptions::doubling(base_delay, base_delay * 16);

        let attempts = self.options.retry_count + 1;
        for attempt in 0..attempts {
            match self.sink.emit(&event).await {
                Ok(()) => return true,
                Err(e) if attempt + 1 < attempts => {
                    let delay = calc_exp_backoff(&backoff, attempt);
                    warn!(
                        "[{}] {} delivery failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.device,
                        event_type,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "[{}] {} delivery failed after {} attempts: {}",
                        self.device, event_type, attempts, e
                    );
                }
            }
        }
        false
    }

    /// Phase change notice
    pub async fn device_progress(&self, status: &DeviceStatus, step: usize, total_steps: usize) -> bool {
        let data = json!({
            "device": status.hostname,
            "phase": status.phase(),
            "step": step,
            "total_steps": total_steps,
            "initial_version": status.current_version,
            "target_version": status.target_version,
            "version_action": status.version_action,
            "success": false,
            "warnings": status.warnings,
        });
        self.emit(EventType::DeviceProgress, status.phase_message.clone(), data)
            .await
    }

    /// Step progress within a phase
    pub async fn upgrade_progress(
        &self,
        phase: UpgradePhase,
        step: &str,
        status: StepStatus,
        progress: Option<u8>,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let data = json!({
            "device": self.device,
            "phase": phase,
            "step": step,
            "status": status,
            "progress": progress,
            "message": message,
        });
        self.emit(EventType::UpgradeProgress, message, data).await
    }

    pub async fn pre_check_result(&self, result: &PreCheckResult, index: usize, total: usize) -> bool {
        let data = json!({
            "device": self.device,
            "index": index,
            "total": total,
            "result": result,
        });
        self.emit(
            EventType::PreCheckResult,
            format!("{}: {}", result.check_name, result.message),
            data,
        )
        .await
    }

    pub async fn pre_check_complete(&self, summary: &PreCheckSummary) -> bool {
        let data = json!({
            "device": self.device,
            "pre_check_summary": summary,
            "can_proceed": summary.can_proceed(),
            "total_checks": summary.total(),
            "passed": summary.passed(),
            "warnings": summary.warnings(),
            "critical_failures": summary.critical_failures(),
        });
        self.emit(EventType::PreCheckComplete, "Pre-check validation completed", data)
            .await
    }

    /// Rollback stage: initiated, rebooting, recovering, validating, completed, failed
    pub async fn rollback_progress(&self, stage: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        let data = json!({ "device": self.device, "stage": stage, "message": message });
        self.emit(EventType::RollbackProgress, message, data).await
    }

    pub async fn rollback_complete(
        &self,
        success: bool,
        kind: Option<RollbackKind>,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let data = json!({
            "device": self.device,
            "success": success,
            "rollback_kind": kind,
            "message": message,
        });
        self.emit(EventType::RollbackComplete, message, data).await
    }

    /// Terminal event carrying the full result
    pub async fn operation_complete(&self, status: &DeviceStatus, success: bool, message: impl Into<String>) -> bool {
        let message = message.into();
        let result = status.upgrade_result.as_ref();
        let data = json!({
            "device": status.hostname,
            "success": success,
            "message": message,
            "phase": status.phase(),
            "initial_version": result.and_then(|r| r.initial_version.clone()),
            "final_version": result.and_then(|r| r.final_version.clone()),
            "version_action": status.version_action,
            "warnings": status.warnings,
            "error": status.error,
            "duration": result.map(|r| r.duration_secs).unwrap_or(0.0),
            "pre_check_summary": status.pre_check_summary,
            "upgrade_result": result,
        });
        self.emit(EventType::OperationComplete, message, data).await
    }
}

#[async_trait]
impl CheckObserver for EventEmitter {
    async fn on_result(&self, result: &PreCheckResult, index: usize, total: usize) {
        self.pre_check_result(result, index, total).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UpgradeError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` deliveries
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventSink for Flaky {
        async fn emit(&self, _event: &UpgradeEvent) -> Result<(), UpgradeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(UpgradeError::Internal("broker down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn emitter(failures: u32) -> (EventEmitter, Arc<Flaky>) {
        let sink = Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        });
        (EventEmitter::new(sink.clone(), Options::default(), "job-1", "r1"), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_fire_and_forget() {
        let (emitter, sink) = emitter(1);
        assert!(!emitter.emit(EventType::DeviceProgress, "x", json!({})).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_value_retries_with_backoff() {
        let (emitter, sink) = emitter(2);
        let start = Instant::now();
        assert!(emitter.emit(EventType::PreCheckComplete, "done", json!({})).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        // 2s then 4s
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_complete_doubles_delay_and_gives_up() {
        let (emitter, sink) = emitter(10);
        let start = Instant::now();
        assert!(!emitter.emit(EventType::OperationComplete, "done", json!({})).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
        // 4s, 8s, 16s
        assert_eq!(start.elapsed(), Duration::from_secs(28));
    }
}
