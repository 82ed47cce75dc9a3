//! Research job worker.
//!
//! A long-running service that leases research jobs, drives the orchestrator,
//! and keeps the lease alive with heartbeats. The heartbeat doubles as the
//! cancellation channel: when the stored `cancel_requested` flag comes back
//! true (or the lease is lost to another worker), the job's cancellation
//! token fires and the orchestrator unwinds cooperatively.
//!
//! On graceful shutdown a running job is abandoned without a terminal write;
//! its lease expires and the next worker reclaims it, the same path a worker
//! crash takes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::error::ResearchError;
use crate::domains::research;
use crate::domains::research::models::ResearchParams;
use crate::kernel::ResearchKernel;

use super::job::Job;

/// The job type this worker handles.
pub const RESEARCH_JOB_TYPE: &str = "research";

/// Configuration for the research worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID for this instance
    pub worker_id: String,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// Lease duration requested at claim time
    pub lease_duration: Duration,
    /// How often to extend the lease
    pub heartbeat_interval: Duration,
    /// Hard upper bound on one job's execution
    pub job_timeout: Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(2),
            lease_duration: config.lease_duration,
            heartbeat_interval: config.heartbeat_interval,
            job_timeout: config.job_timeout,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

/// Worker service that polls, claims, and executes research jobs.
pub struct ResearchWorker {
    kernel: Arc<ResearchKernel>,
    config: WorkerConfig,
}

impl ResearchWorker {
    pub fn new(kernel: Arc<ResearchKernel>, config: WorkerConfig) -> Self {
        Self { kernel, config }
    }

    /// Poll/claim/execute until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "research worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let leased = self
                .kernel
                .jobs
                .lease(
                    &[RESEARCH_JOB_TYPE.to_string()],
                    &self.config.worker_id,
                    self.config.lease_duration,
                )
                .await;

            match leased {
                Ok(Some(job)) => self.process(job, &shutdown).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to lease job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "research worker stopped");
    }

    /// Execute a single claimed job.
    pub async fn process(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id;
        let progress_token = job.progress_token.clone();
        let started = Instant::now();
        debug!(job_id = %job_id, attempt = job.attempts, "processing job");

        let job_cancel = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(job_id, job_cancel.clone(), shutdown.clone());

        let outcome = match serde_json::from_value::<ResearchParams>(job.params.clone()) {
            Err(e) => Err(ResearchError::Validation(format!("invalid job params: {}", e))),
            Ok(params) => {
                match tokio::time::timeout(
                    self.config.job_timeout,
                    research::orchestrator::run(
                        &self.kernel,
                        job_id,
                        params,
                        progress_token.as_deref(),
                        &job_cancel,
                    ),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(ResearchError::Timeout(format!(
                        "job exceeded hard limit {:?}",
                        self.config.job_timeout
                    ))),
                }
            }
        };

        job_cancel.cancel();
        let _ = heartbeat.await;

        let token = progress_token.as_deref();
        match outcome {
            Ok(report_id) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                if let Err(e) = self
                    .kernel
                    .jobs
                    .complete(job_id, &report_id, duration_ms, token)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to record job success");
                }
            }
            Err(ResearchError::Cancelled) if shutdown.is_cancelled() => {
                // Graceful shutdown: leave the job running; the expired
                // lease hands it to the next worker.
                warn!(job_id = %job_id, "job interrupted by shutdown, leaving for lease recovery");
            }
            Err(ResearchError::Cancelled) => {
                if let Err(e) = self.kernel.jobs.finalize_cancel(job_id, token).await {
                    error!(job_id = %job_id, error = %e, "failed to record job cancellation");
                }
            }
            Err(e) => {
                if let Err(record_err) = self.kernel.jobs.fail(job_id, &e, token).await {
                    error!(job_id = %job_id, error = %record_err, "failed to record job failure");
                }
            }
        }
    }

    /// Periodic lease extension; fires the job's cancellation token when the
    /// store reports a cancel request or the lease is lost.
    fn spawn_heartbeat(
        &self,
        job_id: Uuid,
        job_cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let jobs = Arc::clone(&self.kernel.jobs);
        let worker_id = self.config.worker_id.clone();
        let interval_duration = self.config.heartbeat_interval;
        let lease_duration = self.config.lease_duration;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = job_cancel.cancelled() => break,
                    _ = shutdown.cancelled() => {
                        job_cancel.cancel();
                        break;
                    }
                    _ = interval.tick() => {
                        match jobs.heartbeat(job_id, &worker_id, lease_duration).await {
                            Ok(false) => {}
                            Ok(true) => {
                                info!(job_id = %job_id, "cancellation requested, unwinding");
                                job_cancel.cancel();
                                break;
                            }
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "heartbeat failed, aborting job");
                                job_cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_defaults() {
        let config = WorkerConfig::from_config(&crate::Config::default());
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.heartbeat_interval * 3 <= config.lease_duration);
    }

    #[test]
    fn worker_config_with_worker_id() {
        let config =
            WorkerConfig::from_config(&crate::Config::default()).with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
    }
}
