//! Pure OpenRouter REST API client
//!
//! A clean, minimal client for the OpenRouter API with no domain-specific
//! logic. Supports chat completions, SSE streaming, structured outputs, and
//! embeddings.
//!
//! # Example
//!
//! ```rust,ignore
//! use openrouter_client::{OpenRouterClient, ChatRequest, Message};
//!
//! let client = OpenRouterClient::from_env()?;
//!
//! // Chat completion
//! let response = client.chat_completion(ChatRequest {
//!     model: "perplexity/sonar".into(),
//!     messages: vec![Message::user("Hello!")],
//!     ..Default::default()
//! }).await?;
//!
//! // Embeddings
//! let embedding = client.create_embedding("text to embed", "openai/text-embedding-3-small").await?;
//! ```
//!
//! # Type-Safe Structured Output
//!
//! ```rust,ignore
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct Plan {
//!     steps: Vec<String>,
//! }
//!
//! // Schema generated automatically from the type
//! let plan: Plan = client
//!     .extract::<Plan>("openai/gpt-4o", system_prompt, user_prompt)
//!     .await?;
//! ```

pub mod error;
pub mod schema;
pub mod streaming;
pub mod types;

pub use error::{OpenRouterError, Result};
pub use schema::StructuredOutput;
pub use streaming::{ChatCompletionChunk, ChatCompletionStream, ToolCallDelta};
pub use types::*;

use std::time::Duration;

use reqwest::header;
use reqwest::Client;
use tracing::{debug, warn};

/// Pure OpenRouter API client.
#[derive(Clone)]
pub struct OpenRouterClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterClient {
    /// Create a new OpenRouter client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
        }
    }

    /// Create from environment variable `OPENROUTER_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| OpenRouterError::Config("OPENROUTER_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (for proxies or OpenAI-compatible gateways).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Chat completion.
    ///
    /// Send messages to the chat completions API and get a response.
    pub async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start = std::time::Instant::now();

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenRouter request failed");
                map_request_error(e)
            })?;

        let chat_response: types::ChatResponseRaw =
            parse_json_response(response, "chat completion").await?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OpenRouterError::Parse("No choices in response".into()))?;

        debug!(
            model = %request.model,
            duration_ms = start.elapsed().as_millis(),
            "OpenRouter chat completion"
        );

        Ok(ChatResponse {
            content,
            usage: chat_response.usage,
        })
    }

    /// Streaming chat completion.
    ///
    /// Send messages and get a stream of token chunks back.
    /// Uses SSE (server-sent events) from the OpenRouter API.
    pub async fn chat_completion_stream(
        &self,
        request: ChatRequest,
    ) -> Result<ChatCompletionStream> {
        // Build JSON body with stream: true
        let mut body = serde_json::to_value(&request)
            .map_err(|e| OpenRouterError::Parse(format!("Failed to serialize request: {}", e)))?;
        body["stream"] = serde_json::Value::Bool(true);

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenRouter streaming request failed");
                map_request_error(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenRouter streaming API error");
            return Err(OpenRouterError::Api {
                status: status.as_u16(),
                message: error_text,
                retry_after,
            });
        }

        Ok(ChatCompletionStream::new(response.bytes_stream()))
    }

    /// Structured output with a JSON schema.
    ///
    /// Uses the `json_schema` response format for guaranteed valid JSON.
    pub async fn structured_output(&self, request: StructuredRequest) -> Result<String> {
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(map_request_error)?;

        let chat_response: types::ChatResponseRaw =
            parse_json_response(response, "structured output").await?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OpenRouterError::Parse("No choices in response".into()))
    }

    /// Type-safe structured output extraction.
    ///
    /// Generates a JSON schema from the type `T` using `schemars`, sends it
    /// with the request, and deserializes the response.
    pub async fn extract<T: StructuredOutput>(
        &self,
        model: &str,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<T> {
        let schema = T::output_schema();

        debug!(
            type_name = %T::type_name(),
            "Generated schema for structured extraction"
        );

        let request =
            StructuredRequest::new(model, system_prompt, user_prompt, T::type_name(), schema);
        let json_str = self.structured_output(request).await?;

        serde_json::from_str(&json_str)
            .map_err(|e| OpenRouterError::Parse(format!("Failed to deserialize response: {}", e)))
    }

    /// Create an embedding for text.
    pub async fn create_embedding(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        let request = types::EmbeddingRequest {
            model: model.to_string(),
            input: text.to_string(),
        };

        let response = self
            .http_client
            .post(format!("{}/embeddings", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Embedding request failed");
                map_request_error(e)
            })?;

        let embed_response: types::EmbeddingResponse =
            parse_json_response(response, "embedding").await?;

        embed_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| OpenRouterError::Parse("No embedding in response".into()))
    }
}

/// Map a reqwest transport error into a client error.
fn map_request_error(e: reqwest::Error) -> OpenRouterError {
    if e.is_timeout() {
        OpenRouterError::Timeout(e.to_string())
    } else {
        OpenRouterError::Network(e.to_string())
    }
}

/// Read the `Retry-After` header as a delay, when present.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Check status and deserialize a JSON body, folding errors into one place.
async fn parse_json_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(&response);
        let error_text = response.text().await.unwrap_or_default();
        warn!(status = %status, error = %error_text, "OpenRouter {} error", what);
        return Err(OpenRouterError::Api {
            status: status.as_u16(),
            message: error_text,
            retry_after,
        });
    }

    response
        .json()
        .await
        .map_err(|e| OpenRouterError::Parse(e.to_string()))
}
