//! Synthesis agent.
//!
//! One streaming call over the whole ensemble. The prompt carries the
//! formatting directives (audience, output format, length, sources) and
//! instructs the model to keep `[Source: URL]` citations that appear
//! verbatim in the sub-query results. The orchestrator consumes the stream
//! chunk by chunk so cancellation stays responsive.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use openrouter_client::Message;

use crate::common::error::{ResearchError, Result};
use crate::kernel::gateway::{AgentRole, ChatOptions, ProviderGateway};
use crate::kernel::traits::ChunkStream;

use super::models::{AgentResult, AudienceLevel, OutputFormat, ResearchParams};

/// Open the synthesis stream, falling back through the tier on connection
/// failure. Returns the model used and the live stream.
pub async fn open_stream(
    gateway: &ProviderGateway,
    params: &ResearchParams,
    results: &[AgentResult],
    cancel: &CancellationToken,
) -> Result<(String, ChunkStream)> {
    let messages = build_messages(params, results);
    let options = ChatOptions {
        temperature: Some(0.4),
        max_tokens: params.max_length,
        seed: params.seed,
    };

    let mut last_error = ResearchError::Internal("no synthesis model configured".into());
    for model in gateway.models_for(AgentRole::Synthesis, params.cost_preference) {
        if cancel.is_cancelled() {
            return Err(ResearchError::Cancelled);
        }
        match gateway
            .chat_stream(&model, messages.clone(), &options, cancel)
            .await
        {
            Ok(stream) => return Ok((model, stream)),
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(e) => {
                warn!(model = %model, error = %e, "synthesis stream failed to open");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Unique sources across the ensemble, in first-seen order.
pub fn collect_sources(results: &[AgentResult]) -> Vec<String> {
    let mut sources = Vec::new();
    for result in results {
        for source in &result.sources {
            if !sources.contains(source) {
                sources.push(source.clone());
            }
        }
    }
    sources
}

fn build_messages(params: &ResearchParams, results: &[AgentResult]) -> Vec<Message> {
    let audience = match params.audience_level {
        AudienceLevel::Beginner => "a beginner audience; avoid jargon and explain concepts",
        AudienceLevel::Intermediate => "an intermediate audience familiar with the basics",
        AudienceLevel::Expert => "an expert audience; be precise and technical",
    };
    let format = match params.output_format {
        OutputFormat::Report => "a structured report with markdown headings",
        OutputFormat::Briefing => "a concise executive briefing",
        OutputFormat::BulletPoints => "bullet points only",
    };

    let mut system = format!(
        "You are a synthesis agent. Combine the research findings below into {} \
         for {}. Reconcile contradictions between agents explicitly.",
        format, audience
    );
    if params.include_sources {
        system.push_str(
            " Preserve every [Source: URL] citation that appears verbatim in the findings.",
        );
    }
    if let Some(max_length) = params.max_length {
        system.push_str(&format!(" Keep the answer under {} tokens.", max_length));
    }

    let mut user = format!("Original query: {}\n\nResearch findings:\n", params.query);
    for result in results {
        match (&result.result, &result.error) {
            (Some(text), _) => {
                user.push_str(&format!(
                    "\n## {} ({}, model {})\n{}\n",
                    result.agent_id, result.query, result.model, text
                ));
            }
            (None, Some(error)) => {
                user.push_str(&format!(
                    "\n## {} ({})\n(no result: {})\n",
                    result.agent_id, result.query, error
                ));
            }
            (None, None) => {}
        }
    }

    vec![Message::system(system), Message::user(user)]
}
