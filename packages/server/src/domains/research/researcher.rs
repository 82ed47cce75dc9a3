//! Research agent.
//!
//! Executes one sub-query against the provider: picks models from the tier
//! matching the cost preference (the gateway already retries retryable
//! failures per model), falls back through the remaining tier on failure,
//! and returns an error record when every candidate is exhausted. Optionally
//! issues a small ensemble and concatenates the outputs for the synthesizer
//! to reconcile.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use openrouter_client::Message;

use crate::common::error::{ResearchError, Result};
use crate::kernel::gateway::{AgentRole, ChatOptions, ProviderGateway};

use super::attachments::{attachment_context, to_image_urls};
use super::models::{extract_sources, AgentResult, ResearchParams, SubQuery};

/// Maximum models combined in one ensemble answer.
const ENSEMBLE_SIZE: usize = 2;

/// Run one sub-query. `Err` is returned only for cancellation or when every
/// candidate model failed; the caller records that as an error entry in the
/// ensemble.
pub async fn run_sub_query(
    gateway: &ProviderGateway,
    sub_query: &SubQuery,
    params: &ResearchParams,
    cancel: &CancellationToken,
) -> Result<AgentResult> {
    let mut candidates = Vec::new();
    if let Some(pinned) = &sub_query.model {
        candidates.push(pinned.clone());
    }
    candidates.extend(gateway.models_for(AgentRole::Research, params.cost_preference));
    candidates.dedup();

    if sub_query.ensemble {
        return run_ensemble(gateway, sub_query, params, &candidates, cancel).await;
    }

    let mut last_error = ResearchError::Internal("no research model configured".into());
    for model in &candidates {
        if cancel.is_cancelled() {
            return Err(ResearchError::Cancelled);
        }

        match call_model(gateway, model, sub_query, params, cancel).await {
            Ok(content) => {
                debug!(agent_id = %sub_query.agent_id, model = %model, "sub-query answered");
                return Ok(AgentResult {
                    agent_id: sub_query.agent_id.clone(),
                    query: sub_query.query.clone(),
                    model: model.clone(),
                    sources: extract_sources(&content),
                    result: Some(content),
                    error: None,
                });
            }
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(e) => {
                warn!(agent_id = %sub_query.agent_id, model = %model, error = %e, "model failed, trying next tier");
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Issue the sub-query to a small ensemble and concatenate the answers,
/// labeled per model. Partial ensemble failures degrade to whatever
/// answered.
async fn run_ensemble(
    gateway: &ProviderGateway,
    sub_query: &SubQuery,
    params: &ResearchParams,
    candidates: &[String],
    cancel: &CancellationToken,
) -> Result<AgentResult> {
    let mut sections = Vec::new();
    let mut used_models = Vec::new();
    let mut last_error = ResearchError::Internal("no research model configured".into());

    for model in candidates.iter().take(ENSEMBLE_SIZE.max(1)) {
        if cancel.is_cancelled() {
            return Err(ResearchError::Cancelled);
        }
        match call_model(gateway, model, sub_query, params, cancel).await {
            Ok(content) => {
                sections.push(format!("### {}\n{}", model, content));
                used_models.push(model.clone());
            }
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(e) => {
                warn!(agent_id = %sub_query.agent_id, model = %model, error = %e, "ensemble member failed");
                last_error = e;
            }
        }
    }

    if sections.is_empty() {
        return Err(last_error);
    }

    let content = sections.join("\n\n");
    Ok(AgentResult {
        agent_id: sub_query.agent_id.clone(),
        query: sub_query.query.clone(),
        model: used_models.join("+"),
        sources: extract_sources(&content),
        result: Some(content),
        error: None,
    })
}

async fn call_model(
    gateway: &ProviderGateway,
    model: &str,
    sub_query: &SubQuery,
    params: &ResearchParams,
    cancel: &CancellationToken,
) -> Result<String> {
    let messages = build_messages(model, sub_query, params);
    let options = ChatOptions {
        temperature: Some(0.3),
        max_tokens: params.max_length,
        seed: params.seed,
    };
    let response = gateway.chat(model, messages, &options, cancel).await?;
    Ok(response.content)
}

fn build_messages(model: &str, sub_query: &SubQuery, params: &ResearchParams) -> Vec<Message> {
    let system = format!(
        "You are a {} research agent. Answer the question thoroughly and \
         factually. Cite your sources inline as [Source: URL].",
        sub_query.role
    );

    let mut user_text = sub_query.query.clone();
    if let Some(block) = attachment_context(&params.text_documents, &params.structured_data, 4000) {
        user_text.push_str("\n\n");
        user_text.push_str(&block);
    }

    let user = if !params.images.is_empty() && is_vision_capable(model) {
        Message::user_with_images(user_text, to_image_urls(&params.images))
    } else {
        Message::user(user_text)
    };

    vec![Message::system(system), user]
}

/// Only vision-capable models receive image attachments.
fn is_vision_capable(model: &str) -> bool {
    let model = model.to_lowercase();
    ["gpt-4o", "claude", "gemini", "pixtral", "vision", "llava"]
        .iter()
        .any(|family| model.contains(family))
}
