//! Provider gateway: the uniform surface over external chat and embedding
//! models.
//!
//! Knows about model tiers, retryable-error backoff, rate-limit hints,
//! per-call timeouts, and cancellation. Knows nothing about jobs, plans, or
//! reports.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use openrouter_client::{ChatRequest, ChatResponse, Message, StructuredRequest};

use crate::common::error::{ResearchError, Result};
use crate::config::{Config, RoleModels};
use crate::kernel::traits::{BaseChatProvider, ChunkStream};

/// Which pipeline stage a model is being selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Planning,
    Research,
    Synthesis,
}

/// Cost preference from the tool surface; selects the model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostPreference {
    High,
    #[default]
    Low,
}

/// Per-call knobs forwarded to the provider.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Deterministic sampling seed, passed through verbatim when supplied.
    pub seed: Option<u64>,
}

/// Gateway configuration, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub embedding_model: String,
    pub planning_models: RoleModels,
    pub research_models: RoleModels,
    pub synthesis_models: RoleModels,
}

impl GatewayConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.provider_timeout,
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            embedding_model: config.embedding_model.clone(),
            planning_models: config.planning_models.clone(),
            research_models: config.research_models.clone(),
            synthesis_models: config.synthesis_models.clone(),
        }
    }
}

/// Uniform client to external chat/embedding APIs.
pub struct ProviderGateway {
    provider: Arc<dyn BaseChatProvider>,
    config: GatewayConfig,
}

impl ProviderGateway {
    pub fn new(provider: Arc<dyn BaseChatProvider>, config: GatewayConfig) -> Self {
        Self { provider, config }
    }

    /// Candidate models for a role, preferred tier first. For a high cost
    /// preference the low tier is appended as the fallback tier.
    pub fn models_for(&self, role: AgentRole, cost: CostPreference) -> Vec<String> {
        let tiers = match role {
            AgentRole::Planning => &self.config.planning_models,
            AgentRole::Research => &self.config.research_models,
            AgentRole::Synthesis => &self.config.synthesis_models,
        };
        match cost {
            CostPreference::Low => tiers.low.clone(),
            CostPreference::High => {
                let mut models = tiers.high.clone();
                models.extend(tiers.low.iter().cloned());
                models
            }
        }
    }

    /// Blocking chat completion with bounded retries on retryable failures.
    pub async fn chat(
        &self,
        model: &str,
        messages: Vec<Message>,
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        self.with_retries(cancel, || {
            let request = build_request(model, messages.clone(), options);
            async { self.provider.chat(request).await.map_err(ResearchError::from) }
        })
        .await
    }

    /// Open a streaming chat completion. Only connection establishment is
    /// retried; a stream that fails mid-flight surfaces to the caller.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: Vec<Message>,
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        self.with_retries(cancel, || {
            let request = build_request(model, messages.clone(), options);
            async {
                self.provider
                    .chat_stream(request)
                    .await
                    .map_err(ResearchError::from)
            }
        })
        .await
    }

    /// Structured output constrained to a JSON schema.
    pub async fn structured(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
        seed: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.with_retries(cancel, || {
            let mut request = StructuredRequest::new(
                model,
                system_prompt,
                user_prompt,
                schema_name,
                schema.clone(),
            );
            if let Some(seed) = seed {
                request = request.seed(seed);
            }
            async {
                self.provider
                    .structured(request)
                    .await
                    .map_err(ResearchError::from)
            }
        })
        .await
    }

    /// Generate an embedding with the configured embedding model.
    pub async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let model = self.config.embedding_model.clone();
        self.with_retries(cancel, || {
            let model = model.clone();
            async move {
                self.provider
                    .embed(text, &model)
                    .await
                    .map_err(ResearchError::from)
            }
        })
        .await
    }

    /// Run one provider call with timeout, cancellation, and bounded
    /// exponential backoff on retryable errors. Rate-limit hints extend the
    /// computed backoff.
    async fn with_retries<T, F, Fut>(&self, cancel: &CancellationToken, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ResearchError::Cancelled);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(ResearchError::Cancelled),
                result = tokio::time::timeout(self.config.request_timeout, call()) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(ResearchError::Timeout(format!(
                            "provider call exceeded {:?}",
                            self.config.request_timeout
                        ))),
                    }
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt, &e);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    debug!(attempt, error = %e, "provider call failed");
                    return Err(e);
                }
            }
        }
    }

    /// Exponential backoff with jitter. A provider `Retry-After` hint floors
    /// the delay when it is longer than the computed value; a 429 without a
    /// hint still waits at least one full second.
    fn backoff_delay(&self, attempt: u32, error: &ResearchError) -> Duration {
        let base = self.config.backoff_base;
        let exp = base * 2u32.saturating_pow(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 2).max(1));
        let computed = exp + Duration::from_millis(jitter_ms);

        match error {
            ResearchError::ProviderRateLimited {
                retry_after: Some(hint),
                ..
            } => computed.max(*hint),
            ResearchError::ProviderRateLimited {
                retry_after: None, ..
            } => computed.max(Duration::from_secs(1)),
            _ => computed,
        }
    }
}

fn build_request(model: &str, messages: Vec<Message>, options: &ChatOptions) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages,
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        seed: options.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::ScriptedProvider;

    fn gateway_with(provider: ScriptedProvider) -> ProviderGateway {
        let mut config = GatewayConfig::from_config(&Config::default());
        config.backoff_base = Duration::from_millis(1);
        ProviderGateway::new(Arc::new(provider), config)
    }

    #[test]
    fn low_cost_uses_low_tier_only() {
        let gateway = gateway_with(ScriptedProvider::new());
        let models = gateway.models_for(AgentRole::Research, CostPreference::Low);
        assert_eq!(models, Config::default().research_models.low);
    }

    #[test]
    fn high_cost_falls_back_to_low_tier() {
        let gateway = gateway_with(ScriptedProvider::new());
        let models = gateway.models_for(AgentRole::Research, CostPreference::High);
        let config = Config::default();
        assert!(models.len() == config.research_models.high.len() + config.research_models.low.len());
        assert_eq!(models[0], config.research_models.high[0]);
    }

    #[tokio::test]
    async fn chat_returns_scripted_response() {
        let provider = ScriptedProvider::new();
        provider.push_chat_ok("the answer");
        let gateway = gateway_with(provider);

        let response = gateway
            .chat(
                "test/model",
                vec![Message::user("q")],
                &ChatOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.content, "the answer");
    }

    #[tokio::test]
    async fn retries_after_rate_limit_then_succeeds() {
        let provider = ScriptedProvider::new();
        provider.push_chat_rate_limited();
        provider.push_chat_ok("recovered");
        let gateway = gateway_with(provider);

        let response = gateway
            .chat(
                "test/model",
                vec![Message::user("q")],
                &ChatOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.content, "recovered");
    }

    #[tokio::test]
    async fn retry_after_hint_floors_the_backoff() {
        let provider = ScriptedProvider::new();
        provider.push_chat_err(openrouter_client::OpenRouterError::Api {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_millis(300)),
        });
        provider.push_chat_ok("after the hint");
        // backoff_base is 1ms here, so any real wait comes from the hint.
        let gateway = gateway_with(provider);

        let started = std::time::Instant::now();
        let response = gateway
            .chat(
                "test/model",
                vec![Message::user("q")],
                &ChatOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.content, "after the hint");
        assert!(
            started.elapsed() >= Duration::from_millis(300),
            "retry happened before the Retry-After hint elapsed"
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_chat_err(openrouter_client::OpenRouterError::Api {
            status: 400,
            message: "bad model".into(),
            retry_after: None,
        });
        provider.push_chat_ok("never reached");

        let mut config = GatewayConfig::from_config(&Config::default());
        config.backoff_base = Duration::from_millis(1);
        let gateway = ProviderGateway::new(Arc::clone(&provider) as Arc<dyn BaseChatProvider>, config);

        let result = gateway
            .chat(
                "test/model",
                vec![Message::user("q")],
                &ChatOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ResearchError::ProviderPermanent(_))));
        assert_eq!(provider.chat_calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let provider = ScriptedProvider::new();
        provider.push_chat_ok("unused");
        let gateway = gateway_with(provider);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = gateway
            .chat(
                "test/model",
                vec![Message::user("q")],
                &ChatOptions::default(),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(ResearchError::Cancelled)));
    }
}
