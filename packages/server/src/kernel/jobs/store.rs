//! SQLite-backed durable job storage.
//!
//! The lease is the mutual-exclusion primitive: claiming a job is a single
//! conditional `UPDATE ... RETURNING`, so two workers can never hold the
//! same job at once, and a crashed worker's job becomes reclaimable as soon
//! as its lease lapses. Terminal writes are retried a bounded number of
//! times on transient (busy/locked) storage errors.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::common::error::{ResearchError, Result};

use super::events::{JobEvent, JobEventRecord};
use super::job::{Job, JobRow, JobStatus, JOB_COLUMNS};

/// Outcome of `request_cancel`.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// Whether the request took effect (terminal jobs are a no-op).
    pub cancelled: bool,
    pub previous_status: JobStatus,
}

/// Outcome of `fail`.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Retryable failure under the attempt budget; job went back to queued.
    Requeued { run_after: DateTime<Utc> },
    /// Terminal failure.
    Terminal,
}

/// Durable job store over the knowledge base's pool.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly queued job row.
    pub async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, params, status, progress, created_at, updated_at,
                              attempts, idempotency_key, idempotency_expires_at, cancel_requested,
                              progress_token)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.job_type)
        .bind(serde_json::to_string(&job.params)?)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.attempts)
        .bind(&job.idempotency_key)
        .bind(job.idempotency_expires_at.map(|t| t.to_rfc3339()))
        .bind(job.cancel_requested as i64)
        .bind(&job.progress_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a job by id.
    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_job()).transpose()
    }

    /// Most recently submitted live job for an idempotency key, if any.
    pub async fn find_live_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs \
             WHERE idempotency_key = ? AND idempotency_expires_at > ? \
             ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(key)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_job()).transpose()
    }

    /// Expire a key on an old row so a retry submission can reuse it while
    /// keeping the at-most-one-live-row-per-key invariant. The key itself is
    /// kept so retries stay countable.
    pub async fn expire_idempotency_key(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET idempotency_expires_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// How many submissions (live or expired) have used this key.
    pub async fn count_by_idempotency_key(&self, key: &str) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE idempotency_key = ?")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    /// Atomically claim the oldest eligible job of one of the given types:
    /// queued past its backoff gate, or running with an expired lease.
    pub async fn lease_next(
        &self,
        job_types: &[String],
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let lease_expires_at = now
            + chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let placeholders = job_types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            r#"
            UPDATE jobs SET
                status = 'running',
                lease_owner = ?,
                lease_expires_at = ?,
                heartbeat_at = ?,
                attempts = attempts + 1,
                started_at = COALESCE(started_at, ?),
                updated_at = ?,
                run_after = NULL
            WHERE id = (
                SELECT id FROM jobs
                WHERE job_type IN ({})
                  AND (
                    (status = 'queued' AND (run_after IS NULL OR run_after <= ?))
                    OR (status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?)
                  )
                ORDER BY created_at ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            placeholders, JOB_COLUMNS
        );

        let now_str = now.to_rfc3339();
        let mut query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .bind(lease_expires_at.to_rfc3339())
            .bind(&now_str)
            .bind(&now_str)
            .bind(&now_str);
        for job_type in job_types {
            query = query.bind(job_type);
        }
        let row = query
            .bind(&now_str)
            .bind(&now_str)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_job()).transpose()
    }

    /// Extend the lease. Returns whether cancellation has been requested so
    /// the worker can unwind cooperatively. Fails when the caller no longer
    /// owns the lease or the job is terminal.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let lease_expires_at = now
            + chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let row = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = ?, heartbeat_at = ?, updated_at = ?
            WHERE id = ? AND lease_owner = ? AND status = 'running'
            RETURNING cancel_requested
            "#,
        )
        .bind(lease_expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(job_id.to_string())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.get::<i64, _>("cancel_requested") != 0),
            None => Err(ResearchError::NotFound(format!(
                "job {} is not leased by {}",
                job_id, worker_id
            ))),
        }
    }

    /// Record a successful terminal transition.
    pub async fn complete(&self, job_id: Uuid, result: &serde_json::Value) -> Result<()> {
        let result_json = serde_json::to_string(result)?;
        self.with_storage_retry(|| async {
            let now = Utc::now().to_rfc3339();
            let updated = sqlx::query(
                r#"
                UPDATE jobs SET status = 'succeeded', result = ?, progress = 100,
                                finished_at = ?, updated_at = ?,
                                lease_owner = NULL, lease_expires_at = NULL
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(&result_json)
            .bind(&now)
            .bind(&now)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 0 {
                return Err(invalid_transition(job_id, "succeeded"));
            }
            Ok(())
        })
        .await
    }

    /// Record a failure: re-queue with backoff when retryable and under the
    /// attempt budget, terminal `failed` otherwise.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error: &serde_json::Value,
        retryable: bool,
        max_attempts: i64,
        backoff_base: Duration,
    ) -> Result<FailOutcome> {
        let job = self
            .get(job_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound(format!("job {}", job_id)))?;

        if retryable && job.attempts < max_attempts {
            let run_after = Utc::now() + backoff_with_jitter(backoff_base, job.attempts);
            let error_json = serde_json::to_string(error)?;
            self.with_storage_retry(|| async {
                let now = Utc::now().to_rfc3339();
                let updated = sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'queued', error = ?, run_after = ?,
                                    updated_at = ?,
                                    lease_owner = NULL, lease_expires_at = NULL
                    WHERE id = ? AND status = 'running'
                    "#,
                )
                .bind(&error_json)
                .bind(run_after.to_rfc3339())
                .bind(&now)
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await?
                .rows_affected();

                if updated == 0 {
                    return Err(invalid_transition(job_id, "queued"));
                }
                Ok(())
            })
            .await?;
            return Ok(FailOutcome::Requeued { run_after });
        }

        let error_json = serde_json::to_string(error)?;
        self.with_storage_retry(|| async {
            let now = Utc::now().to_rfc3339();
            let updated = sqlx::query(
                r#"
                UPDATE jobs SET status = 'failed', error = ?, finished_at = ?, updated_at = ?,
                                lease_owner = NULL, lease_expires_at = NULL
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(&error_json)
            .bind(&now)
            .bind(&now)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 0 {
                return Err(invalid_transition(job_id, "failed"));
            }
            Ok(())
        })
        .await?;
        Ok(FailOutcome::Terminal)
    }

    /// Request cancellation: queued jobs flip to `cancelled` immediately,
    /// running jobs get the cooperative flag, terminal jobs are a no-op.
    pub async fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        let now = Utc::now().to_rfc3339();
        let cancelled_error =
            serde_json::to_string(&serde_json::json!({"code": "cancelled", "message": "cancelled by request"}))?;

        // Queued -> cancelled directly.
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET status = 'cancelled', cancel_requested = 1, error = ?,
                            finished_at = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(&cancelled_error)
        .bind(&now)
        .bind(&now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated > 0 {
            return Ok(CancelOutcome {
                cancelled: true,
                previous_status: JobStatus::Queued,
            });
        }

        // Running (or parked) -> set the cooperative flag.
        let row = sqlx::query(
            r#"
            UPDATE jobs SET cancel_requested = 1, updated_at = ?
            WHERE id = ? AND status IN ('running', 'input_required')
            RETURNING status
            "#,
        )
        .bind(&now)
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(CancelOutcome {
                cancelled: true,
                previous_status: JobStatus::parse(&row.get::<String, _>("status"))?,
            });
        }

        // Terminal or missing.
        let job = self
            .get(job_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound(format!("job {}", job_id)))?;
        Ok(CancelOutcome {
            cancelled: false,
            previous_status: job.status,
        })
    }

    /// Terminal `cancelled` transition for a job that was running.
    pub async fn finalize_cancel(&self, job_id: Uuid) -> Result<()> {
        let cancelled_error =
            serde_json::to_string(&serde_json::json!({"code": "cancelled", "message": "cancelled by request"}))?;
        self.with_storage_retry(|| async {
            let now = Utc::now().to_rfc3339();
            let updated = sqlx::query(
                r#"
                UPDATE jobs SET status = 'cancelled', error = ?, finished_at = ?, updated_at = ?,
                                lease_owner = NULL, lease_expires_at = NULL
                WHERE id = ? AND status IN ('running', 'input_required')
                "#,
            )
            .bind(&cancelled_error)
            .bind(&now)
            .bind(&now)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 0 {
                return Err(invalid_transition(job_id, "cancelled"));
            }
            Ok(())
        })
        .await
    }

    /// Monotonic progress update; a lower percent never overwrites a higher.
    pub async fn set_progress(&self, job_id: Uuid, percent: u8) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET progress = MAX(progress, ?), updated_at = ? WHERE id = ?",
        )
        .bind(percent as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append an event with the next per-job sequence number.
    pub async fn append_event(&self, job_id: Uuid, event: &JobEvent) -> Result<JobEventRecord> {
        let ts = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO job_events (job_id, seq, event_type, payload, ts)
            VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_events WHERE job_id = ?), ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(job_id.to_string())
        .bind(job_id.to_string())
        .bind(event.event_type())
        .bind(serde_json::to_string(event)?)
        .bind(ts.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(JobEventRecord {
            seq: row.get("seq"),
            job_id,
            event: event.clone(),
            ts,
        })
    }

    /// Replay events after `since_seq`, oldest first.
    pub async fn list_events(
        &self,
        job_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> Result<Vec<JobEventRecord>> {
        let rows = sqlx::query(
            "SELECT seq, payload, ts FROM job_events \
             WHERE job_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(job_id.to_string())
        .bind(since_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            let event: JobEvent = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "skipping malformed event payload");
                    continue;
                }
            };
            let ts = DateTime::parse_from_rfc3339(&row.get::<String, _>("ts"))
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            records.push(JobEventRecord {
                seq: row.get("seq"),
                job_id,
                event,
                ts,
            });
        }
        Ok(records)
    }

    /// Delete terminal jobs older than the TTL together with their events.
    pub async fn cleanup_expired(&self, job_ttl: Duration) -> Result<u64> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(job_ttl).unwrap_or_else(|_| chrono::Duration::hours(1)))
        .to_rfc3339();

        sqlx::query(
            "DELETE FROM job_events WHERE job_id IN (
                SELECT id FROM jobs
                WHERE status IN ('succeeded', 'failed', 'cancelled') AND finished_at < ?
            )",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = sqlx::query(
            "DELETE FROM jobs \
             WHERE status IN ('succeeded', 'failed', 'cancelled') AND finished_at < ?",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }

    /// Recent jobs, newest first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_job()).collect()
    }

    /// Bounded retry for terminal writes that hit a busy database. The
    /// in-memory view only changes after the persisted write lands.
    async fn with_storage_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(e) if matches!(e, ResearchError::StorageTransient(_)) && attempt < 3 => {
                    attempt += 1;
                    warn!(attempt, error = %e, "storage write busy, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }
}

fn invalid_transition(job_id: Uuid, target: &str) -> ResearchError {
    ResearchError::Validation(format!(
        "job {} cannot transition to {} from its current status",
        job_id, target
    ))
}

/// Exponential backoff with jitter for retry re-queues, capped at 5 minutes.
fn backoff_with_jitter(base: Duration, attempts: i64) -> chrono::Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(attempts.max(1) as u32 - 1))
        .min(Duration::from_secs(300));
    let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64).max(1) / 2);
    chrono::Duration::from_std(exp + Duration::from_millis(jitter_ms))
        .unwrap_or_else(|_| chrono::Duration::seconds(300))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::events::Phase;
    use crate::kernel::kb::KnowledgeBase;

    async fn test_store() -> SqliteJobStore {
        let kb = KnowledgeBase::in_memory(3, 0.7).await.unwrap();
        SqliteJobStore::new(kb.pool().clone())
    }

    fn research_job() -> Job {
        Job::new(
            "research",
            serde_json::json!({"query": "q"}),
            None,
            Duration::from_secs(3600),
        )
    }

    fn research_types() -> Vec<String> {
        vec!["research".to_string()]
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.attempts, 0);
    }

    #[tokio::test]
    async fn lease_claims_oldest_queued_job() {
        let store = test_store().await;
        let first = research_job();
        store.insert(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = research_job();
        store.insert(&second).await.unwrap();

        let leased = store
            .lease_next(&research_types(), "worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(leased.id, first.id);
        assert_eq!(leased.status, JobStatus::Running);
        assert_eq!(leased.attempts, 1);
        assert_eq!(leased.lease_owner.as_deref(), Some("worker-1"));
        assert!(leased.started_at.is_some());
    }

    #[tokio::test]
    async fn only_one_worker_leases_a_job() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        let a = store
            .lease_next(&research_types(), "worker-a", Duration::from_secs(30))
            .await
            .unwrap();
        let b = store
            .lease_next(&research_types(), "worker-b", Duration::from_secs(30))
            .await
            .unwrap();

        assert!(a.is_some());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_and_increments_attempts() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        store
            .lease_next(&research_types(), "worker-a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let reclaimed = store
            .lease_next(&research_types(), "worker-b", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn heartbeat_requires_lease_ownership() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store
            .lease_next(&research_types(), "worker-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(!store
            .heartbeat(job.id, "worker-a", Duration::from_secs(30))
            .await
            .unwrap());

        let stolen = store
            .heartbeat(job.id, "worker-b", Duration::from_secs(30))
            .await;
        assert!(matches!(stolen, Err(ResearchError::NotFound(_))));
    }

    #[tokio::test]
    async fn heartbeat_reports_cancel_requested() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store
            .lease_next(&research_types(), "worker-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        store.request_cancel(job.id).await.unwrap();
        assert!(store
            .heartbeat(job.id, "worker-a", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn complete_sets_terminal_state_and_result() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store
            .lease_next(&research_types(), "w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        store
            .complete(job.id, &serde_json::json!({"reportId": "r1"}))
            .await
            .unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Succeeded);
        assert!(loaded.result.is_some());
        assert!(loaded.error.is_none());
        assert!(loaded.finished_at.is_some());
        assert_eq!(loaded.progress, 100);
    }

    #[tokio::test]
    async fn complete_rejects_non_running_jobs() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        let result = store.complete(job.id, &serde_json::json!({})).await;
        assert!(matches!(result, Err(ResearchError::Validation(_))));
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store
            .lease_next(&research_types(), "w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .fail(
                job.id,
                &serde_json::json!({"code": "timeout"}),
                true,
                3,
                Duration::from_millis(100),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, FailOutcome::Requeued { .. }));
        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Queued);
        assert!(loaded.run_after.is_some());

        // The backoff gate holds the job back from an immediate re-lease.
        let leased = store
            .lease_next(&research_types(), "w", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store
            .lease_next(&research_types(), "w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .fail(
                job.id,
                &serde_json::json!({"code": "timeout"}),
                true,
                1,
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, FailOutcome::Terminal));
        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.error.is_some());
        assert!(loaded.result.is_none());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal_immediately() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store
            .lease_next(&research_types(), "w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .fail(
                job.id,
                &serde_json::json!({"code": "validation_error"}),
                false,
                3,
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Terminal));
    }

    #[tokio::test]
    async fn cancel_queued_is_immediate() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        let outcome = store.request_cancel(job.id).await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.previous_status, JobStatus::Queued);

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Cancelled);
        assert!(loaded.error.is_some());
    }

    #[tokio::test]
    async fn cancel_terminal_is_noop() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store.request_cancel(job.id).await.unwrap();

        let second = store.request_cancel(job.id).await.unwrap();
        assert!(!second.cancelled);
        assert_eq!(second.previous_status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn event_seq_is_gapless_per_job() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        for i in 0..5 {
            let record = store
                .append_event(
                    job.id,
                    &JobEvent::Progress {
                        percent: i * 10,
                        message: "working".into(),
                    },
                )
                .await
                .unwrap();
            assert_eq!(record.seq, i as i64 + 1);
        }

        let events = store.list_events(job.id, 0, 100).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn event_replay_concatenation_equals_full_log() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        store
            .append_event(job.id, &JobEvent::PhaseStarted { phase: Phase::Planning })
            .await
            .unwrap();
        store
            .append_event(job.id, &JobEvent::PhaseComplete { phase: Phase::Planning })
            .await
            .unwrap();
        store.append_event(job.id, &JobEvent::JobCancelled).await.unwrap();

        let first = store.list_events(job.id, 0, 2).await.unwrap();
        let last_seq = first.last().unwrap().seq;
        let rest = store.list_events(job.id, last_seq, 100).await.unwrap();
        let full = store.list_events(job.id, 0, 100).await.unwrap();

        let stitched: Vec<i64> = first.iter().chain(rest.iter()).map(|e| e.seq).collect();
        let expected: Vec<i64> = full.iter().map(|e| e.seq).collect();
        assert_eq!(stitched, expected);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();

        store.set_progress(job.id, 40).await.unwrap();
        store.set_progress(job.id, 20).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 40);
    }

    #[tokio::test]
    async fn cleanup_removes_old_terminal_jobs_and_events() {
        let store = test_store().await;
        let job = research_job();
        store.insert(&job).await.unwrap();
        store.append_event(job.id, &JobEvent::JobCancelled).await.unwrap();
        store.request_cancel(job.id).await.unwrap();

        // TTL zero: everything terminal is eligible on the next pass.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let deleted = store.cleanup_expired(Duration::from_secs(0)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(job.id).await.unwrap().is_none());
        assert!(store.list_events(job.id, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn idempotency_key_lookup_honors_expiry() {
        let store = test_store().await;
        let live = Job::new(
            "research",
            serde_json::json!({}),
            Some("key-live".into()),
            Duration::from_secs(3600),
        );
        store.insert(&live).await.unwrap();

        let expired = Job::new(
            "research",
            serde_json::json!({}),
            Some("key-expired".into()),
            Duration::from_secs(0),
        );
        store.insert(&expired).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store
            .find_live_by_idempotency_key("key-live")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_live_by_idempotency_key("key-expired")
            .await
            .unwrap()
            .is_none());
    }
}
