// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// The gateway, agents, and tests all consume providers through
// `BaseChatProvider` so the concrete OpenRouter client can be swapped for a
// scripted mock.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use openrouter_client::{
    ChatCompletionChunk, ChatRequest, ChatResponse, OpenRouterClient, OpenRouterError,
    StructuredRequest,
};

/// Boxed stream of chat completion chunks.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, OpenRouterError>> + Send>>;

// =============================================================================
// Chat Provider Trait (Infrastructure - uniform LLM surface)
// =============================================================================

#[async_trait]
pub trait BaseChatProvider: Send + Sync {
    /// Blocking chat completion.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, OpenRouterError>;

    /// Streaming chat completion.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, OpenRouterError>;

    /// Chat completion constrained to a JSON schema; returns the raw JSON string.
    async fn structured(&self, request: StructuredRequest) -> Result<String, OpenRouterError>;

    /// Generate an embedding vector for text.
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, OpenRouterError>;
}

#[async_trait]
impl BaseChatProvider for OpenRouterClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, OpenRouterError> {
        self.chat_completion(request).await
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, OpenRouterError> {
        let stream = self.chat_completion_stream(request).await?;
        Ok(Box::pin(stream))
    }

    async fn structured(&self, request: StructuredRequest) -> Result<String, OpenRouterError> {
        self.structured_output(request).await
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, OpenRouterError> {
        self.create_embedding(text, model).await
    }
}
