//! Job runner: one independent pipeline per device

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::app::options::UpgradeOptions;
use crate::connectivity::probe::TcpProber;
use crate::connectivity::ReachabilityMonitor;
use crate::device::connector::DeviceConnector;
use crate::device::DeviceTransport;
use crate::errors::UpgradeError;
use crate::models::job::UpgradeJob;
use crate::models::result::{SoftwareState, UpgradeResult};
use crate::models::status::DeviceStatus;
use crate::progress::emitter::EventEmitter;
use crate::progress::sink::EventSink;
use crate::upgrade::context::RunContext;
use crate::upgrade::phase::PhaseEvent;
use crate::upgrade::upgrader::DeviceUpgrader;

/// Runs jobs against a transport, reporting through one sink
#[derive(Clone)]
pub struct JobRunner {
    transport: Arc<dyn DeviceTransport>,
    prober: Arc<dyn TcpProber>,
    sink: Arc<dyn EventSink>,
    options: Arc<UpgradeOptions>,
    max_concurrent_devices: usize,
}

impl JobRunner {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        prober: Arc<dyn TcpProber>,
        sink: Arc<dyn EventSink>,
        options: UpgradeOptions,
        max_concurrent_devices: usize,
    ) -> Self {
        Self {
            transport,
            prober,
            sink,
            options: Arc::new(options),
            max_concurrent_devices: max_concurrent_devices.max(1),
        }
    }

    /// Run every device of a job to a terminal phase. Statuses come back in
    /// the job's hostname order.
    pub async fn run_job(&self, job: &UpgradeJob) -> Result<Vec<DeviceStatus>, UpgradeError> {
        job.validate()?;
        info!(
            "Job {}: {:?} on {} device(s), at most {} at a time",
            job.job_id,
            job.command,
            job.hostnames.len(),
            self.max_concurrent_devices
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_devices));
        let mut tasks = JoinSet::new();

        for (index, host) in job.hostnames.iter().enumerate() {
            let emitter = EventEmitter::new(self.sink.clone(), self.options.events.clone(), &job.job_id, host);
            let ctx = RunContext::new(&job.job_id, host, self.options.clone(), emitter.clone());
            let params = job.connection(host, self.options.connection.connect_timeout);
            let connector = DeviceConnector::new(self.transport.clone(), params.clone(), self.options.connection.clone());
            let monitor = ReachabilityMonitor::new(
                params,
                self.transport.clone(),
                self.prober.clone(),
                self.options.reachability.clone(),
            );
            let request = job.request();
            let upgrader = DeviceUpgrader::new(ctx, request.clone(), connector, monitor);
            let semaphore = semaphore.clone();
            let job_id = job.job_id.clone();
            let host = host.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let status = match tokio::spawn(upgrader.run()).await {
                    Ok(status) => status,
                    Err(e) => {
                        let mut status =
                            DeviceStatus::new(&job_id, &host, &request.target_version, &request.image_filename);
                        abort_status(&mut status, &emitter, &e.to_string()).await;
                        status
                    }
                };
                (index, status)
            });
        }

        let mut statuses = Vec::with_capacity(job.hostnames.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => statuses.push(entry),
                Err(e) => error!("Job {}: device task lost: {}", job.job_id, e),
            }
        }
        statuses.sort_by_key(|(index, _)| *index);

        let statuses: Vec<DeviceStatus> = statuses.into_iter().map(|(_, status)| status).collect();
        let succeeded = statuses
            .iter()
            .filter(|s| s.upgrade_result.as_ref().is_some_and(|r| r.success))
            .count();
        info!(
            "Job {} finished: {}/{} device(s) succeeded",
            job.job_id,
            succeeded,
            statuses.len()
        );
        Ok(statuses)
    }
}

/// Terminal failure for a pipeline that died without reporting
async fn abort_status(status: &mut DeviceStatus, emitter: &EventEmitter, reason: &str) {
    let message = format!("upgrade task aborted: {}", reason);
    error!("[{}] {}", status.hostname, message);

    status.set_error(message.clone(), "InternalError");
    if let Err(e) = status.update_phase(PhaseEvent::Fail(message.clone()), message.clone()) {
        error!("[{}] Unable to record abort: {}", status.hostname, e);
    }

    let mut result = UpgradeResult::new();
    result.add_error(message.clone());
    result.software_state = SoftwareState::Unknown;
    result.finalize(false);
    status.upgrade_result = Some(result);

    emitter.operation_complete(status, false, message).await;
}
