//! Typed errors for the research core.
//!
//! Uses `thiserror` for the library layers (not `anyhow`) so callers can
//! branch on the kind: the job manager needs to distinguish retryable from
//! terminal failures, and the tool surface maps kinds to single-line
//! messages.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for research-core operations.
pub type Result<T> = std::result::Result<T, ResearchError>;

/// Errors that can occur across the orchestration pipeline.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Invalid tool arguments or malformed input
    #[error("validation error: {0}")]
    Validation(String),

    /// Job or report does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// A call exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Provider rejected the call with a rate limit; `retry_after` carries
    /// the provider's `Retry-After` hint when one was sent
    #[error("provider rate limited: {message}")]
    ProviderRateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Provider transient failure (5xx, connection errors)
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider permanent rejection (4xx other than 429)
    #[error("provider rejected request: {0}")]
    ProviderPermanent(String),

    /// Transient storage failure (busy / locked database)
    #[error("storage busy: {0}")]
    StorageTransient(String),

    /// Permanent storage failure
    #[error("storage error: {0}")]
    StoragePermanent(String),

    /// The planner returned output that could not be parsed
    #[error("plan parse error: {0}")]
    PlanParse(String),

    /// Every sub-query in the ensemble failed
    #[error("no successful sub-query results")]
    NoResults,

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResearchError {
    /// Whether the operation could succeed if retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ResearchError::Timeout(_)
                | ResearchError::ProviderRateLimited { .. }
                | ResearchError::ProviderUnavailable(_)
                | ResearchError::StorageTransient(_)
        )
    }

    /// Stable machine-readable code used in `job_error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ResearchError::Validation(_) => "validation_error",
            ResearchError::NotFound(_) => "not_found",
            ResearchError::Cancelled => "cancelled",
            ResearchError::Timeout(_) => "timeout",
            ResearchError::ProviderRateLimited { .. } => "provider_rate_limited",
            ResearchError::ProviderUnavailable(_) => "provider_unavailable",
            ResearchError::ProviderPermanent(_) => "provider_permanent",
            ResearchError::StorageTransient(_) => "storage_transient",
            ResearchError::StoragePermanent(_) => "storage_permanent",
            ResearchError::PlanParse(_) => "plan_parse_error",
            ResearchError::NoResults => "no_results",
            ResearchError::Internal(_) => "internal",
        }
    }
}

impl From<openrouter_client::OpenRouterError> for ResearchError {
    fn from(e: openrouter_client::OpenRouterError) -> Self {
        use openrouter_client::OpenRouterError;
        let retry_after = e.retry_after();
        match e {
            OpenRouterError::Timeout(m) => ResearchError::Timeout(m),
            OpenRouterError::Network(m) => ResearchError::ProviderUnavailable(m),
            OpenRouterError::Api {
                status: 429,
                message,
                ..
            } => ResearchError::ProviderRateLimited {
                message,
                retry_after,
            },
            OpenRouterError::Api {
                status, message, ..
            } if (500..=599).contains(&status) => {
                ResearchError::ProviderUnavailable(format!("status {}: {}", status, message))
            }
            OpenRouterError::Api {
                status, message, ..
            } => ResearchError::ProviderPermanent(format!("status {}: {}", status, message)),
            OpenRouterError::Config(m) => ResearchError::Internal(m),
            OpenRouterError::Parse(m) => ResearchError::ProviderPermanent(m),
        }
    }
}

impl From<sqlx::Error> for ResearchError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let message = db.message().to_lowercase();
                if message.contains("locked") || message.contains("busy") {
                    ResearchError::StorageTransient(db.message().to_string())
                } else {
                    ResearchError::StoragePermanent(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => ResearchError::StorageTransient(e.to_string()),
            sqlx::Error::RowNotFound => ResearchError::NotFound(e.to_string()),
            _ => ResearchError::StoragePermanent(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ResearchError {
    fn from(e: serde_json::Error) -> Self {
        ResearchError::Internal(format!("JSON error: {}", e))
    }
}
