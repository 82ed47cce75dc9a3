//! Tools driving the research job lifecycle: submission, status, cancel.

use std::sync::Arc;

use serde_json::json;

use crate::common::error::Result;
use crate::kernel::jobs::{SubmitOptions, RESEARCH_JOB_TYPE};
use crate::kernel::ResearchKernel;

use super::params::{parse_args, CancelJobArgs, JobStatusArgs, StatusFormat, SubmitResearchArgs};
use super::ToolResponse;

/// `submit_research`: validate, normalize, and enqueue an async job.
pub async fn submit_research(
    kernel: &Arc<ResearchKernel>,
    args: serde_json::Value,
) -> Result<ToolResponse> {
    let args: SubmitResearchArgs = parse_args(args)?;
    args.params.validate(kernel.config.max_document_bytes)?;

    let params_value = serde_json::to_value(&args.params)?;
    let outcome = kernel
        .jobs
        .submit(
            RESEARCH_JOB_TYPE,
            params_value,
            SubmitOptions {
                idempotency_key: args.idempotency_key,
                force_new: args.force_new,
                progress_token: args.progress_token,
            },
        )
        .await?;

    let job = kernel.jobs.get(outcome.job_id).await?;
    let mut body = json!({
        "jobId": outcome.job_id.to_string(),
        "status": job.status,
        "sseUrl": format!("/jobs/{}/events", outcome.job_id),
    });
    if outcome.already_existed {
        body["reused"] = json!(true);
    }
    if let Some(result) = outcome.reused_result {
        body["cached"] = json!(true);
        body["result"] = result;
    }

    Ok(ToolResponse::json(&body))
}

/// `job_status`: summary, full, or event-log view of one job.
pub async fn job_status(
    kernel: &Arc<ResearchKernel>,
    args: serde_json::Value,
) -> Result<ToolResponse> {
    let args: JobStatusArgs = parse_args(args)?;
    let job = kernel.jobs.get(args.job_id).await?;

    let mut body = json!({
        "jobId": job.id.to_string(),
        "status": job.status,
        "progress": job.progress,
        "attempts": job.attempts,
        "createdAt": job.created_at.to_rfc3339(),
        "startedAt": job.started_at.map(|t| t.to_rfc3339()),
        "finishedAt": job.finished_at.map(|t| t.to_rfc3339()),
    });

    match args.format {
        StatusFormat::Summary => {
            if let Some(error) = &job.error {
                body["error"] = error.clone();
            }
        }
        StatusFormat::Full => {
            body["params"] = job.params.clone();
            body["cancelRequested"] = json!(job.cancel_requested);
            if let Some(result) = &job.result {
                body["result"] = result.clone();
            }
            if let Some(error) = &job.error {
                body["error"] = error.clone();
            }
        }
        StatusFormat::Events => {
            let events = kernel
                .jobs
                .events(
                    args.job_id,
                    args.since_seq.unwrap_or(0),
                    args.max_events.clamp(1, 1000),
                )
                .await?;
            body["events"] = json!(events
                .iter()
                .map(|record| json!({
                    "seq": record.seq,
                    "type": record.event.event_type(),
                    "ts": record.ts.to_rfc3339(),
                    "event": record.event,
                }))
                .collect::<Vec<_>>());
        }
    }

    Ok(ToolResponse::json(&body))
}

/// `cancel_job`: request cancellation; immediate for queued jobs.
pub async fn cancel_job(
    kernel: &Arc<ResearchKernel>,
    args: serde_json::Value,
) -> Result<ToolResponse> {
    let args: CancelJobArgs = parse_args(args)?;
    let outcome = kernel.jobs.cancel(args.job_id).await?;

    Ok(ToolResponse::json(&json!({
        "cancelled": outcome.cancelled,
        "previousStatus": outcome.previous_status,
    })))
}
