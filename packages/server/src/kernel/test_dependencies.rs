//! Scripted provider for tests.
//!
//! Queue-driven mock of [`BaseChatProvider`]: tests push responses (or
//! failures) per method and inspect recorded calls afterwards. Embeddings
//! are deterministic hashes of the input text so identical texts always
//! embed identically without a network call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use openrouter_client::{
    ChatCompletionChunk, ChatRequest, ChatResponse, OpenRouterError, StructuredRequest,
};

use super::traits::{BaseChatProvider, ChunkStream};

/// Dimension of deterministic mock embeddings. Wide enough that two
/// unrelated texts never collide above the similarity thresholds.
pub const MOCK_EMBED_DIM: usize = 32;

/// Deterministic pseudo-embedding derived from the text's sha256.
pub fn mock_embedding(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    digest[..MOCK_EMBED_DIM]
        .iter()
        .map(|b| (*b as f32 / 255.0) * 2.0 - 1.0)
        .collect()
}

type Scripted<T> = Mutex<VecDeque<Result<T, OpenRouterError>>>;

/// Scripted mock provider.
///
/// Responses are consumed front-to-back; with an empty queue the mock
/// falls back to a generic canned answer so unscripted calls don't hang
/// tests.
#[derive(Default)]
pub struct ScriptedProvider {
    chat_responses: Scripted<String>,
    structured_responses: Scripted<String>,
    stream_scripts: Scripted<Vec<String>>,
    embed_failures: Scripted<()>,

    chat_calls: AtomicUsize,
    structured_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    embed_calls: AtomicUsize,

    chat_requests: Mutex<Vec<ChatRequest>>,

    /// Artificial latency before each chat answer, for cancellation tests.
    chat_delay: Mutex<Option<std::time::Duration>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    // Scripting ---------------------------------------------------------------

    pub fn push_chat_ok(&self, content: impl Into<String>) {
        self.lock(&self.chat_responses).push_back(Ok(content.into()));
    }

    pub fn push_chat_err(&self, error: OpenRouterError) {
        self.lock(&self.chat_responses).push_back(Err(error));
    }

    pub fn push_chat_rate_limited(&self) {
        self.push_chat_err(OpenRouterError::Api {
            status: 429,
            message: "rate limited".into(),
            retry_after: None,
        });
    }

    pub fn push_structured_ok(&self, json: impl Into<String>) {
        self.lock(&self.structured_responses)
            .push_back(Ok(json.into()));
    }

    pub fn push_structured_err(&self, error: OpenRouterError) {
        self.lock(&self.structured_responses).push_back(Err(error));
    }

    pub fn push_stream(&self, chunks: &[&str]) {
        self.lock(&self.stream_scripts)
            .push_back(Ok(chunks.iter().map(|c| c.to_string()).collect()));
    }

    pub fn push_stream_err(&self, error: OpenRouterError) {
        self.lock(&self.stream_scripts).push_back(Err(error));
    }

    pub fn set_chat_delay(&self, delay: std::time::Duration) {
        *self.lock(&self.chat_delay) = Some(delay);
    }

    pub fn push_embed_failure(&self) {
        self.lock(&self.embed_failures)
            .push_back(Err(OpenRouterError::Api {
                status: 503,
                message: "embedding service down".into(),
                retry_after: None,
            }));
    }

    // Inspection --------------------------------------------------------------

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn structured_calls(&self) -> usize {
        self.structured_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Models the chat calls were issued against, in order.
    pub fn chat_models(&self) -> Vec<String> {
        self.lock(&self.chat_requests)
            .iter()
            .map(|r| r.model.clone())
            .collect()
    }

    fn lock<'a, T>(&self, m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn last_user_text(request: &ChatRequest) -> String {
        request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_text())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BaseChatProvider for ScriptedProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, OpenRouterError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.lock(&self.chat_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fallback = format!("Scripted response to: {}", Self::last_user_text(&request));
        self.lock(&self.chat_requests).push(request);

        match self.lock(&self.chat_responses).pop_front() {
            Some(Ok(content)) => Ok(ChatResponse {
                content,
                usage: None,
            }),
            Some(Err(e)) => Err(e),
            None => Ok(ChatResponse {
                content: fallback,
                usage: None,
            }),
        }
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, OpenRouterError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.lock(&self.chat_requests).push(request);

        let chunks = match self.lock(&self.stream_scripts).pop_front() {
            Some(Ok(chunks)) => chunks,
            Some(Err(e)) => return Err(e),
            None => vec!["Mock synthesis of the ensemble.".to_string()],
        };

        let mut items: Vec<Result<ChatCompletionChunk, OpenRouterError>> = chunks
            .into_iter()
            .map(|delta| {
                Ok(ChatCompletionChunk {
                    delta,
                    ..Default::default()
                })
            })
            .collect();
        items.push(Ok(ChatCompletionChunk {
            done: true,
            ..Default::default()
        }));

        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn structured(&self, request: StructuredRequest) -> Result<String, OpenRouterError> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        let user_text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_text())
            .unwrap_or_default();

        match self.lock(&self.structured_responses).pop_front() {
            Some(Ok(json)) => Ok(json),
            Some(Err(e)) => Err(e),
            None => {
                // Minimal single-step plan echoing the prompt, so unscripted
                // pipeline tests still run end to end.
                let query: String = user_text.chars().take(120).collect();
                Ok(serde_json::json!({
                    "sub_queries": [{"query": query, "role": "general"}],
                    "complete": true,
                })
                .to_string())
            }
        }
    }

    async fn embed(&self, text: &str, _model: &str) -> Result<Vec<f32>, OpenRouterError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(Err(e)) = self.lock(&self.embed_failures).pop_front() {
            return Err(e);
        }
        Ok(mock_embedding(text))
    }
}
