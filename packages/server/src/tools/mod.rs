//! Public tool surface.
//!
//! Every tool takes an untyped JSON argument map and returns the uniform
//! `{content: [{type: "text", text}], isError?}` shape. Errors produce a
//! single-line message; detailed diagnostics live in the job event log and
//! the tracing output, not in tool responses.
//!
//! The tool-call protocol adapter (stdio / streamable HTTP framing) is
//! external; it routes named calls into [`dispatch`].

pub mod params;
pub mod report_tools;
pub mod research_tools;

use std::sync::Arc;

use serde::Serialize;

use crate::common::error::ResearchError;
use crate::kernel::ResearchKernel;

/// Uniform tool return shape.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

impl ToolResponse {
    /// Plain text success.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    /// JSON success, rendered as pretty text.
    pub fn json<T: Serialize>(value: &T) -> Self {
        let text = serde_json::to_string_pretty(value)
            .unwrap_or_else(|e| format!("serialization error: {}", e));
        Self::text(text)
    }

    /// Error response with a single-line message.
    pub fn error(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            content: vec![ToolContent::Text {
                text: message.lines().next().unwrap_or_default().to_string(),
            }],
            is_error: Some(true),
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// The first text block, for assertions and logging.
    pub fn first_text(&self) -> &str {
        match self.content.first() {
            Some(ToolContent::Text { text }) => text,
            None => "",
        }
    }
}

/// Route one named tool call.
pub async fn dispatch(
    kernel: &Arc<ResearchKernel>,
    tool: &str,
    args: serde_json::Value,
) -> ToolResponse {
    let result = match tool {
        "submit_research" => research_tools::submit_research(kernel, args).await,
        "job_status" => research_tools::job_status(kernel, args).await,
        "cancel_job" => research_tools::cancel_job(kernel, args).await,
        "get_report" => report_tools::get_report(kernel, args).await,
        "search" => report_tools::search(kernel, args).await,
        "rate_report" => report_tools::rate_report(kernel, args).await,
        "list_reports" => report_tools::list_reports(kernel, args).await,
        other => Err(ResearchError::Validation(format!("unknown tool: {}", other))),
    };

    match result {
        Ok(response) => response,
        Err(e) => ToolResponse::error(e.to_string()),
    }
}
