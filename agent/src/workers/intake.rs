//! Job intake worker: consumes queued jobs at most once per job id

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::app::run::JobRunner;
use crate::models::job::UpgradeJob;
use crate::models::status::DeviceStatus;

/// Intake worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Job ids remembered for duplicate detection
    pub seen_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { seen_capacity: 4096 }
    }
}

/// Finished job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub statuses: Vec<DeviceStatus>,
}

/// Bounded memory of dispatched job ids
struct SeenJobs {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenJobs {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// False if the id was already dispatched
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

/// Run the intake worker until the queue closes or shutdown is signalled.
/// Each job completes before the next is taken.
pub async fn run(
    options: &Options,
    runner: &JobRunner,
    mut jobs: mpsc::Receiver<UpgradeJob>,
    reports: mpsc::UnboundedSender<JobReport>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Intake worker starting...");
    let mut seen = SeenJobs::new(options.seen_capacity);

    loop {
        let job = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Intake worker shutting down...");
                return;
            }
            job = jobs.recv() => match job {
                Some(job) => job,
                None => {
                    info!("Job queue closed, intake worker exiting");
                    return;
                }
            },
        };

        if !seen.insert(&job.job_id) {
            warn!("Skipping duplicate job {}", job.job_id);
            continue;
        }

        info!("Received job {} for {}", job.job_id, job.hostnames.join(", "));
        match runner.run_job(&job).await {
            Ok(statuses) => {
                let report = JobReport {
                    job_id: job.job_id.clone(),
                    statuses,
                };
                if reports.send(report).is_err() {
                    warn!("Report receiver dropped; job {} result not delivered", job.job_id);
                }
            }
            Err(e) => error!("Job {} rejected: {}", job.job_id, e),
        }
    }
}
