//! Job manager: the public surface over the durable job store.
//!
//! Owns submission (with idempotency), status reads, event replay and live
//! subscriptions, cancellation, progress plumbing, and the TTL cleanup loop.
//! Workers drive jobs through `lease` / `heartbeat` / `complete` / `fail`.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::error::{ResearchError, Result};
use crate::common::hash::validate_idempotency_key;
use crate::config::Config;
use crate::kernel::stream_hub::StreamHub;

use super::events::{JobEvent, JobEventRecord};
use super::job::{Job, JobStatus};
use super::store::{CancelOutcome, FailOutcome, SqliteJobStore};

/// How many submissions may reuse one idempotency key after failures.
const IDEMPOTENT_RETRY_LIMIT: i64 = 3;

/// Options accepted by `submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub idempotency_key: Option<String>,
    pub force_new: bool,
    pub progress_token: Option<String>,
}

/// Outcome of `submit`.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: Uuid,
    /// True when an existing job was returned instead of creating one.
    pub already_existed: bool,
    /// Set when the existing job already succeeded; the caller can serve
    /// this result without waiting.
    pub reused_result: Option<serde_json::Value>,
}

/// Durable queue + event log + notification fan-out.
pub struct JobManager {
    store: SqliteJobStore,
    hub: StreamHub,
    idempotency_ttl: Duration,
    job_ttl: Duration,
    max_attempts: i64,
    retry_backoff_base: Duration,
}

impl JobManager {
    pub fn new(store: SqliteJobStore, hub: StreamHub, config: &Config) -> Self {
        Self {
            store,
            hub,
            idempotency_ttl: config.idempotency_ttl,
            job_ttl: config.job_ttl,
            max_attempts: config.max_attempts,
            retry_backoff_base: Duration::from_secs(2),
        }
    }

    /// The hub topic carrying a job's live events.
    pub fn topic(job_id: Uuid) -> String {
        format!("job:{}", job_id)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a job. With an idempotency key, a live prior submission is
    /// returned instead of creating a duplicate; a failed or cancelled prior
    /// submission may be retried a bounded number of times within the key's
    /// TTL window. `force_new` bypasses the lookup entirely.
    pub async fn submit(
        &self,
        job_type: &str,
        params: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<SubmitOutcome> {
        if let Some(key) = &options.idempotency_key {
            validate_idempotency_key(key)?;
        }

        if !options.force_new {
            if let Some(key) = &options.idempotency_key {
                if let Some(existing) = self.store.find_live_by_idempotency_key(key).await? {
                    match existing.status {
                        JobStatus::Succeeded => {
                            return Ok(SubmitOutcome {
                                job_id: existing.id,
                                already_existed: true,
                                reused_result: existing.result,
                            });
                        }
                        JobStatus::Queued | JobStatus::Running | JobStatus::InputRequired => {
                            return Ok(SubmitOutcome {
                                job_id: existing.id,
                                already_existed: true,
                                reused_result: None,
                            });
                        }
                        JobStatus::Failed | JobStatus::Cancelled => {
                            let used = self.store.count_by_idempotency_key(key).await?;
                            if used >= IDEMPOTENT_RETRY_LIMIT {
                                return Ok(SubmitOutcome {
                                    job_id: existing.id,
                                    already_existed: true,
                                    reused_result: None,
                                });
                            }
                            // Release the key from the dead row, then fall
                            // through to a fresh submission.
                            self.store.expire_idempotency_key(existing.id).await?;
                        }
                    }
                }
            }
        }

        let job = Job::new(
            job_type,
            params,
            options.idempotency_key,
            self.idempotency_ttl,
        )
        .with_progress_token(options.progress_token);

        self.store.insert(&job).await?;
        info!(job_id = %job.id, job_type, "job submitted");

        Ok(SubmitOutcome {
            job_id: job.id,
            already_existed: false,
            reused_result: None,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound(format!("job {}", job_id)))
    }

    /// Replay persisted events after `since_seq`.
    pub async fn events(
        &self,
        job_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> Result<Vec<JobEventRecord>> {
        // Surface NotFound for unknown jobs rather than an empty log.
        self.get(job_id).await?;
        self.store.list_events(job_id, since_seq, limit).await
    }

    /// Live subscription to a job's events. The channel ends for the caller
    /// once a terminal event has been received (terminal events are always
    /// published).
    pub async fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<serde_json::Value> {
        self.hub.subscribe(&Self::topic(job_id)).await
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        self.store.list_recent(limit).await
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Request cancellation. Queued jobs transition immediately; running
    /// jobs observe the flag at their next cooperative point.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        let outcome = self.store.request_cancel(job_id).await?;
        if outcome.cancelled && outcome.previous_status == JobStatus::Queued {
            self.emit(job_id, JobEvent::JobCancelled, None).await?;
        }
        Ok(outcome)
    }

    // =========================================================================
    // Worker surface
    // =========================================================================

    pub async fn lease(
        &self,
        job_types: &[String],
        worker_id: &str,
        duration: Duration,
    ) -> Result<Option<Job>> {
        self.store.lease_next(job_types, worker_id, duration).await
    }

    /// Extend the lease; returns whether cancellation was requested.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        duration: Duration,
    ) -> Result<bool> {
        self.store.heartbeat(job_id, worker_id, duration).await
    }

    /// Terminal success: persists the result, then emits `job_complete`.
    pub async fn complete(
        &self,
        job_id: Uuid,
        report_id: &str,
        duration_ms: u64,
        progress_token: Option<&str>,
    ) -> Result<()> {
        self.store
            .complete(job_id, &serde_json::json!({ "reportId": report_id }))
            .await?;
        self.emit(
            job_id,
            JobEvent::JobComplete {
                report_id: report_id.to_string(),
                duration_ms,
            },
            progress_token,
        )
        .await?;
        Ok(())
    }

    /// Failure: re-queues retryable failures under the attempt budget,
    /// otherwise records the terminal error. Emits `job_error` either way.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error: &ResearchError,
        progress_token: Option<&str>,
    ) -> Result<FailOutcome> {
        let retryable = error.retryable();
        let error_value = serde_json::json!({
            "code": error.code(),
            "message": error.to_string(),
            "retryable": retryable,
        });

        let outcome = self
            .store
            .fail(
                job_id,
                &error_value,
                retryable,
                self.max_attempts,
                self.retry_backoff_base,
            )
            .await?;

        match &outcome {
            FailOutcome::Requeued { run_after } => {
                warn!(job_id = %job_id, run_after = %run_after, error = %error, "job re-queued after retryable failure");
            }
            FailOutcome::Terminal => {
                warn!(job_id = %job_id, error = %error, "job failed");
            }
        }

        self.emit(
            job_id,
            JobEvent::JobError {
                code: error.code().to_string(),
                message: error.to_string(),
                retryable,
            },
            progress_token,
        )
        .await?;
        Ok(outcome)
    }

    /// Terminal cancellation of a running job, with its closing event.
    pub async fn finalize_cancel(&self, job_id: Uuid, progress_token: Option<&str>) -> Result<()> {
        self.store.finalize_cancel(job_id).await?;
        self.emit(job_id, JobEvent::JobCancelled, progress_token)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Append an event to the log, keep the job's progress monotonic, push
    /// to live subscribers, and forward to the transport progress topic when
    /// a progress token exists.
    pub async fn emit(
        &self,
        job_id: Uuid,
        event: JobEvent,
        progress_token: Option<&str>,
    ) -> Result<JobEventRecord> {
        if let JobEvent::Progress { percent, .. } = &event {
            self.store.set_progress(job_id, *percent).await?;
        }

        let record = self.store.append_event(job_id, &event).await?;

        let payload = serde_json::json!({
            "seq": record.seq,
            "jobId": job_id.to_string(),
            "ts": record.ts.to_rfc3339(),
            "event": record.event,
        });
        self.hub.publish(&Self::topic(job_id), payload.clone()).await;
        if let Some(token) = progress_token {
            self.hub
                .publish(&format!("progress:{}", token), payload)
                .await;
        }

        Ok(record)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Periodically delete terminal jobs (and their events) past the TTL.
    pub async fn run_cleanup_loop(&self, shutdown: CancellationToken) {
        let interval = self.job_ttl.min(Duration::from_secs(300)).max(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.store.cleanup_expired(self.job_ttl).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "cleaned up expired jobs"),
                        Err(e) => warn!(error = %e, "job cleanup failed"),
                    }
                    self.hub.cleanup().await;
                }
            }
        }
    }
}
