//! Error types for the OpenRouter client.

use std::time::Duration;

use thiserror::Error;

/// Result type for OpenRouter client operations.
pub type Result<T> = std::result::Result<T, OpenRouterError>;

/// OpenRouter client errors.
#[derive(Debug, Error)]
pub enum OpenRouterError {
    /// Configuration error (missing API key, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, DNS, TLS)
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded its deadline
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// API error (non-2xx response)
    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        /// Rate-limit hint from the `Retry-After` header, when present.
        retry_after: Option<Duration>,
    },

    /// Parse error (invalid JSON, unexpected response format)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl OpenRouterError {
    /// Whether this error is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, OpenRouterError::Api { status: 429, .. })
    }

    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OpenRouterError::Network(_) | OpenRouterError::Timeout(_) => true,
            OpenRouterError::Api { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 529)
            }
            OpenRouterError::Config(_) | OpenRouterError::Parse(_) => false,
        }
    }

    /// Rate-limit hint, if the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OpenRouterError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
