//! Job lifecycle events.
//!
//! These are facts about what happened, not commands. They are appended to
//! the per-job event log (strictly increasing `seq`, never rewritten) and
//! pushed to live subscribers through the stream hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline phases reported in phase events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Researching,
    Synthesizing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Researching => "researching",
            Phase::Synthesizing => "synthesizing",
        }
    }
}

/// Events produced while a job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    PhaseStarted {
        phase: Phase,
    },
    PhaseComplete {
        phase: Phase,
    },
    Progress {
        percent: u8,
        message: String,
    },
    AgentProgress {
        current: u32,
        total: u32,
        #[serde(rename = "agentId")]
        agent_id: String,
        ok: bool,
    },
    SynthesisChunk {
        content: String,
        #[serde(rename = "tokensGenerated")]
        tokens_generated: u64,
    },
    CacheHit {
        #[serde(rename = "reportId")]
        report_id: String,
    },
    JobComplete {
        #[serde(rename = "reportId")]
        report_id: String,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    JobError {
        code: String,
        message: String,
        retryable: bool,
    },
    JobCancelled,
}

impl JobEvent {
    /// The event-log type string; phase events carry the phase as a suffix
    /// (`phase_started:planning`).
    pub fn event_type(&self) -> String {
        match self {
            JobEvent::PhaseStarted { phase } => format!("phase_started:{}", phase.as_str()),
            JobEvent::PhaseComplete { phase } => format!("phase_complete:{}", phase.as_str()),
            JobEvent::Progress { .. } => "progress".to_string(),
            JobEvent::AgentProgress { .. } => "agent_progress".to_string(),
            JobEvent::SynthesisChunk { .. } => "synthesis_chunk".to_string(),
            JobEvent::CacheHit { .. } => "cache_hit".to_string(),
            JobEvent::JobComplete { .. } => "job_complete".to_string(),
            JobEvent::JobError { .. } => "job_error".to_string(),
            JobEvent::JobCancelled => "job_cancelled".to_string(),
        }
    }

    /// Terminal events end the stream for live subscribers.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::JobComplete { .. } | JobEvent::JobError { .. } | JobEvent::JobCancelled
        )
    }
}

/// One persisted event-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEventRecord {
    pub seq: i64,
    pub job_id: Uuid,
    pub event: JobEvent,
    pub ts: DateTime<Utc>,
}
