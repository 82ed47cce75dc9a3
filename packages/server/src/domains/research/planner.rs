//! Planning agent.
//!
//! One structured-output provider call turns the query (plus prior-iteration
//! results and past-report context) into an ordered sub-query plan. A parse
//! failure triggers exactly one retry with a stricter prompt; a second
//! failure is fatal for the iteration.

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use openrouter_client::StructuredOutput;

use crate::common::error::{ResearchError, Result};
use crate::kernel::gateway::{AgentRole, ProviderGateway};

use super::attachments::attachment_context;
use super::models::{AgentResult, ResearchParams, SubQuery};

/// The planner's structured output.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResearchPlan {
    /// Ordered sub-queries; empty means the planner has nothing to add.
    #[serde(default)]
    pub sub_queries: Vec<PlannedSubQuery>,
    /// Terminal marker: coverage is complete, skip further refinement.
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlannedSubQuery {
    pub query: String,
    /// e.g. "general", "technical", "source_analysis"
    #[serde(default)]
    pub role: Option<String>,
    /// Pin a specific model for this sub-query.
    #[serde(default)]
    pub model: Option<String>,
    /// Request a small model ensemble for contested questions.
    #[serde(default)]
    pub ensemble: Option<bool>,
}

/// Outcome of one planning round.
#[derive(Debug)]
pub struct PlanOutcome {
    pub sub_queries: Vec<SubQuery>,
    pub complete: bool,
}

/// Ask the planner for the next round of sub-queries.
pub async fn plan(
    gateway: &ProviderGateway,
    params: &ResearchParams,
    past_context: Option<&str>,
    previous_results: &[AgentResult],
    iteration: u32,
    cancel: &CancellationToken,
) -> Result<PlanOutcome> {
    let models = gateway.models_for(AgentRole::Planning, params.cost_preference);
    let schema = ResearchPlan::output_schema();
    let user_prompt = build_user_prompt(params, past_context, previous_results, iteration);

    let mut last_error = ResearchError::PlanParse("no planning model available".into());
    for model in &models {
        for strict in [false, true] {
            if cancel.is_cancelled() {
                return Err(ResearchError::Cancelled);
            }

            let raw = match gateway
                .structured(
                    model,
                    &system_prompt(strict),
                    &user_prompt,
                    "research_plan",
                    schema.clone(),
                    params.seed,
                    cancel,
                )
                .await
            {
                Ok(raw) => raw,
                Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
                Err(e) => {
                    // Provider failure: no point re-asking the same model
                    // with a stricter prompt, move to the next candidate.
                    warn!(model = %model, error = %e, "planning call failed");
                    last_error = e;
                    break;
                }
            };

            match serde_json::from_str::<ResearchPlan>(&raw) {
                Ok(plan) => {
                    debug!(
                        model = %model,
                        sub_queries = plan.sub_queries.len(),
                        complete = plan.complete,
                        iteration,
                        "plan produced"
                    );
                    return Ok(assign_agent_ids(plan, iteration));
                }
                Err(e) => {
                    warn!(model = %model, error = %e, strict, "plan output failed to parse");
                    last_error = ResearchError::PlanParse(format!(
                        "planner output was not valid JSON: {}",
                        e
                    ));
                    // Retry once with the stricter prompt, then give up on
                    // this model.
                }
            }
        }
        if matches!(last_error, ResearchError::PlanParse(_)) {
            // Two parse failures on one model end the round.
            return Err(last_error);
        }
    }

    Err(last_error)
}

fn assign_agent_ids(plan: ResearchPlan, iteration: u32) -> PlanOutcome {
    let sub_queries = plan
        .sub_queries
        .into_iter()
        .enumerate()
        .map(|(idx, planned)| SubQuery {
            agent_id: format!("agent-{}-{}", iteration, idx),
            query: planned.query,
            role: planned.role.unwrap_or_else(|| "general".to_string()),
            model: planned.model,
            ensemble: planned.ensemble.unwrap_or(false),
        })
        .collect();

    PlanOutcome {
        sub_queries,
        complete: plan.complete,
    }
}

fn system_prompt(strict: bool) -> String {
    let base = "You are a research planning agent. Decompose the research query into \
                focused, independent sub-queries that together cover the topic. Give \
                each sub-query a role: \"general\", \"technical\", or \"source_analysis\". \
                Set \"complete\": true when the sub-queries fully cover the query and no \
                refinement round is needed. Respond only with JSON matching the schema.";
    if strict {
        format!(
            "{} Your previous answer was not valid JSON. Output a single JSON object \
             with a \"sub_queries\" array and a \"complete\" boolean, and nothing else.",
            base
        )
    } else {
        base.to_string()
    }
}

fn build_user_prompt(
    params: &ResearchParams,
    past_context: Option<&str>,
    previous_results: &[AgentResult],
    iteration: u32,
) -> String {
    let mut prompt = format!("Research query: {}\n", params.query);

    if let Some(block) = attachment_context(&params.text_documents, &params.structured_data, 2000) {
        prompt.push_str("\n");
        prompt.push_str(&block);
    }

    if let Some(context) = past_context {
        prompt.push_str(
            "\nContext from prior reports (advisory only, you may ignore it):\n",
        );
        prompt.push_str(context);
        prompt.push('\n');
    }

    if !previous_results.is_empty() {
        prompt.push_str(&format!(
            "\nThis is refinement round {}. Results gathered so far:\n",
            iteration
        ));
        for result in previous_results {
            match (&result.result, &result.error) {
                (Some(text), _) => {
                    let head: String = text.chars().take(600).collect();
                    prompt.push_str(&format!("- [{}] {}: {}\n", result.agent_id, result.query, head));
                }
                (None, Some(error)) => {
                    prompt.push_str(&format!(
                        "- [{}] {}: FAILED ({})\n",
                        result.agent_id, result.query, error
                    ));
                }
                (None, None) => {}
            }
        }
        prompt.push_str(
            "\nPropose only sub-queries that close real gaps. If coverage is complete, \
             return an empty sub_queries array with complete: true.\n",
        );
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel::gateway::GatewayConfig;
    use crate::kernel::test_dependencies::ScriptedProvider;
    use std::sync::Arc;

    fn gateway(provider: ScriptedProvider) -> ProviderGateway {
        let mut config = GatewayConfig::from_config(&Config::default());
        config.backoff_base = std::time::Duration::from_millis(1);
        ProviderGateway::new(Arc::new(provider), config)
    }

    #[tokio::test]
    async fn parses_scripted_plan() {
        let provider = ScriptedProvider::new();
        provider.push_structured_ok(
            r#"{"sub_queries":[{"query":"history of rust","role":"general"},
                {"query":"borrow checker internals","role":"technical","ensemble":true}],
                "complete":true}"#,
        );
        let gateway = gateway(provider);

        let outcome = plan(
            &gateway,
            &ResearchParams::for_query("rust"),
            None,
            &[],
            1,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.sub_queries.len(), 2);
        assert_eq!(outcome.sub_queries[0].agent_id, "agent-1-0");
        assert_eq!(outcome.sub_queries[1].role, "technical");
        assert!(outcome.sub_queries[1].ensemble);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn retries_once_on_parse_failure() {
        let provider = ScriptedProvider::new();
        provider.push_structured_ok("not json at all");
        provider.push_structured_ok(r#"{"sub_queries":[{"query":"q1"}],"complete":false}"#);
        let gateway = gateway(provider);

        let outcome = plan(
            &gateway,
            &ResearchParams::for_query("q"),
            None,
            &[],
            1,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.sub_queries.len(), 1);
        assert_eq!(outcome.sub_queries[0].role, "general");
    }

    #[tokio::test]
    async fn second_parse_failure_is_fatal() {
        let provider = ScriptedProvider::new();
        provider.push_structured_ok("garbage one");
        provider.push_structured_ok("garbage two");
        let gateway = gateway(provider);

        let result = plan(
            &gateway,
            &ResearchParams::for_query("q"),
            None,
            &[],
            1,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ResearchError::PlanParse(_))));
    }

    #[tokio::test]
    async fn refinement_prompt_mentions_previous_results() {
        let params = ResearchParams::for_query("rust");
        let previous = vec![AgentResult {
            agent_id: "agent-1-0".into(),
            query: "history".into(),
            model: "m".into(),
            result: Some("Rust began at Mozilla".into()),
            error: None,
            sources: vec![],
        }];
        let prompt = build_user_prompt(&params, None, &previous, 2);
        assert!(prompt.contains("refinement round 2"));
        assert!(prompt.contains("Rust began at Mozilla"));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_planning() {
        let gateway = gateway(ScriptedProvider::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = plan(
            &gateway,
            &ResearchParams::for_query("q"),
            None,
            &[],
            1,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(ResearchError::Cancelled)));
    }
}
