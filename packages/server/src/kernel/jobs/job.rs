//! Job model for asynchronous research execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::error::{ResearchError, Result};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    /// Waiting on caller input; a protocol adapter resumes the job.
    InputRequired,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::InputRequired => "input_required",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "input_required" => Ok(JobStatus::InputRequired),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ResearchError::StoragePermanent(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The transition table. `running -> queued` is the retry re-queue path.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, InputRequired)
                | (Running, Queued)
                | (InputRequired, Running)
                | (InputRequired, Cancelled)
        )
    }
}

// ============================================================================
// Job model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    /// Completion percent, non-decreasing over the job's lifetime.
    pub progress: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub idempotency_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// Earliest time a queued job may be leased (set on retry backoff).
    pub run_after: Option<DateTime<Utc>>,
    /// Transport-supplied token attached to live progress notifications.
    pub progress_token: Option<String>,
}

impl Job {
    /// Build a fresh queued job.
    pub fn new(
        job_type: impl Into<String>,
        params: serde_json::Value,
        idempotency_key: Option<String>,
        idempotency_ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let idempotency_expires_at = idempotency_key.as_ref().map(|_| {
            now + chrono::Duration::from_std(idempotency_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24))
        });

        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            params,
            status: JobStatus::Queued,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            lease_owner: None,
            lease_expires_at: None,
            heartbeat_at: None,
            attempts: 0,
            result: None,
            error: None,
            idempotency_key,
            idempotency_expires_at,
            cancel_requested: false,
            run_after: None,
            progress_token: None,
        }
    }

    /// Attach a transport progress token.
    pub fn with_progress_token(mut self, token: Option<String>) -> Self {
        self.progress_token = token;
        self
    }

    /// Whether the lease has lapsed and the job is reclaimable.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.lease_expires_at.map(|t| t < now).unwrap_or(true)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

pub(crate) const JOB_COLUMNS: &str = "id, job_type, params, status, progress, created_at, \
    updated_at, started_at, finished_at, lease_owner, lease_expires_at, heartbeat_at, attempts, \
    result, error, idempotency_key, idempotency_expires_at, cancel_requested, run_after, \
    progress_token";

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    id: String,
    job_type: String,
    params: String,
    status: String,
    progress: i64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    heartbeat_at: Option<String>,
    attempts: i64,
    result: Option<String>,
    error: Option<String>,
    idempotency_key: Option<String>,
    idempotency_expires_at: Option<String>,
    cancel_requested: i64,
    run_after: Option<String>,
    progress_token: Option<String>,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ResearchError::StoragePermanent(format!("invalid timestamp: {}", e)))
}

fn parse_ts_opt(raw: Option<&String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(r)).transpose()
}

impl JobRow {
    pub(crate) fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| ResearchError::StoragePermanent(format!("invalid job id: {}", e)))?,
            job_type: self.job_type,
            params: serde_json::from_str(&self.params).unwrap_or_default(),
            status: JobStatus::parse(&self.status)?,
            progress: self.progress,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: parse_ts_opt(self.started_at.as_ref())?,
            finished_at: parse_ts_opt(self.finished_at.as_ref())?,
            lease_owner: self.lease_owner,
            lease_expires_at: parse_ts_opt(self.lease_expires_at.as_ref())?,
            heartbeat_at: parse_ts_opt(self.heartbeat_at.as_ref())?,
            attempts: self.attempts,
            result: self.result.and_then(|r| serde_json::from_str(&r).ok()),
            error: self.error.and_then(|e| serde_json::from_str(&e).ok()),
            idempotency_key: self.idempotency_key,
            idempotency_expires_at: parse_ts_opt(self.idempotency_expires_at.as_ref())?,
            cancel_requested: self.cancel_requested != 0,
            run_after: parse_ts_opt(self.run_after.as_ref())?,
            progress_token: self.progress_token,
        })
    }
}
