//! Tools over the knowledge base: report retrieval, search, feedback.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::error::{ResearchError, Result};
use crate::kernel::ResearchKernel;

use super::params::{
    parse_args, GetReportArgs, ListReportsArgs, RateReportArgs, ReportMode, SearchArgs,
};
use super::ToolResponse;

const SUMMARY_CHARS: usize = 500;
const TRUNCATE_CHARS: usize = 2000;

/// `get_report`: fetch a persisted report in full, summary, or truncated form.
pub async fn get_report(
    kernel: &Arc<ResearchKernel>,
    args: serde_json::Value,
) -> Result<ToolResponse> {
    let args: GetReportArgs = parse_args(args)?;
    let report = kernel
        .kb
        .get_report(&args.report_id)
        .await?
        .ok_or_else(|| ResearchError::NotFound(format!("report {}", args.report_id)))?;

    let content = match args.mode {
        ReportMode::Full => report.content.clone(),
        ReportMode::Summary => head_chars(&report.content, SUMMARY_CHARS),
        ReportMode::Truncate => head_chars(&report.content, TRUNCATE_CHARS),
    };

    Ok(ToolResponse::json(&json!({
        "reportId": report.id,
        "query": report.query,
        "createdAt": report.created_at.to_rfc3339(),
        "rating": report.rating,
        "metadata": report.metadata,
        "basedOnReportIds": report.based_on_report_ids,
        "content": content,
    })))
}

/// `search`: hybrid BM25 + vector search over reports and indexed documents.
pub async fn search(
    kernel: &Arc<ResearchKernel>,
    args: serde_json::Value,
) -> Result<ToolResponse> {
    let args: SearchArgs = parse_args(args)?;
    if args.query.trim().is_empty() {
        return Err(ResearchError::Validation("query must not be empty".into()));
    }

    // Embedding is best-effort: without it the search is lexical only.
    let embedding = match kernel
        .gateway
        .embed(&args.query, &CancellationToken::new())
        .await
    {
        Ok(embedding) => Some(embedding),
        Err(e) => {
            debug!(error = %e, "search embedding unavailable, using BM25 only");
            None
        }
    };

    let hits = kernel
        .kb
        .search_hybrid(
            &args.query,
            embedding.as_deref(),
            args.limit.max(0) as usize,
            args.scope.into(),
        )
        .await?;

    Ok(ToolResponse::json(&json!({
        "query": args.query,
        "results": hits
            .iter()
            .map(|hit| json!({
                "sourceType": hit.source_type,
                "sourceId": hit.source_id,
                "title": hit.title,
                "snippet": hit.snippet,
                "score": hit.score,
            }))
            .collect::<Vec<_>>(),
    })))
}

/// `rate_report`: attach a 1-5 rating and optional comment.
pub async fn rate_report(
    kernel: &Arc<ResearchKernel>,
    args: serde_json::Value,
) -> Result<ToolResponse> {
    let args: RateReportArgs = parse_args(args)?;
    kernel
        .kb
        .add_feedback_to_report(&args.report_id, args.rating, args.comment.as_deref())
        .await?;

    Ok(ToolResponse::json(&json!({
        "reportId": args.report_id,
        "rating": args.rating,
    })))
}

/// `list_reports`: most recent reports, newest first.
pub async fn list_reports(
    kernel: &Arc<ResearchKernel>,
    args: serde_json::Value,
) -> Result<ToolResponse> {
    let args: ListReportsArgs = parse_args(args)?;
    let reports = kernel.kb.list_recent_reports(args.limit.max(0)).await?;

    Ok(ToolResponse::json(&json!({
        "reports": reports
            .iter()
            .map(|report| json!({
                "reportId": report.id,
                "query": report.query,
                "createdAt": report.created_at.to_rfc3339(),
                "rating": report.rating,
            }))
            .collect::<Vec<_>>(),
    })))
}

fn head_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
