use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Model tiers for one agent role: ordered best-first within each tier.
#[derive(Debug, Clone)]
pub struct RoleModels {
    pub low: Vec<String>,
    pub high: Vec<String>,
}

impl RoleModels {
    fn new(low: &[&str], high: &[&str]) -> Self {
        Self {
            low: low.iter().map(|s| s.to_string()).collect(),
            high: high.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key (required outside tests)
    pub openrouter_api_key: String,
    /// Directory holding the embedded knowledge base
    pub kb_path: String,

    // Orchestration
    pub max_iterations: u32,
    pub max_concurrency: usize,
    pub provider_timeout: Duration,
    /// Hard upper bound on a single job's wall-clock time
    pub job_timeout: Duration,

    // Job manager
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub idempotency_ttl: Duration,
    pub job_ttl: Duration,
    pub max_attempts: i64,
    pub worker_count: usize,

    // Retrieval
    pub cache_sim_threshold: f32,
    pub past_report_sim_floor: f32,
    pub vector_dim: usize,
    pub hybrid_bm25_weight: f32,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,

    // Attachments
    pub max_document_bytes: usize,

    // Models
    pub embedding_model: String,
    pub planning_models: RoleModels,
    pub research_models: RoleModels,
    pub synthesis_models: RoleModels,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openrouter_api_key: String::new(),
            kb_path: "./data/kb".to_string(),
            max_iterations: 2,
            max_concurrency: 4,
            provider_timeout: Duration::from_secs(120),
            job_timeout: Duration::from_secs(600),
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            job_ttl: Duration::from_secs(3600),
            max_attempts: 3,
            worker_count: 2,
            cache_sim_threshold: 0.85,
            past_report_sim_floor: 0.70,
            vector_dim: 384,
            hybrid_bm25_weight: 0.7,
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(24 * 3600),
            max_document_bytes: 256 * 1024,
            embedding_model: "openai/text-embedding-3-small".to_string(),
            planning_models: RoleModels::new(
                &["google/gemini-2.0-flash-001", "openai/gpt-4o-mini"],
                &["anthropic/claude-sonnet-4", "openai/gpt-4o"],
            ),
            research_models: RoleModels::new(
                &[
                    "perplexity/sonar",
                    "google/gemini-2.0-flash-001",
                    "openai/gpt-4o-mini",
                ],
                &[
                    "perplexity/sonar-pro",
                    "anthropic/claude-sonnet-4",
                    "openai/gpt-4o",
                ],
            ),
            synthesis_models: RoleModels::new(
                &["google/gemini-2.0-flash-001", "openai/gpt-4o-mini"],
                &["anthropic/claude-sonnet-4", "openai/gpt-4o"],
            ),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Config::default();

        Ok(Self {
            openrouter_api_key: env::var("OPENROUTER_API_KEY")
                .context("OPENROUTER_API_KEY must be set")?,
            kb_path: env::var("KB_PATH").unwrap_or(defaults.kb_path),
            max_iterations: env_parse("MAX_ITERATIONS", defaults.max_iterations)?,
            max_concurrency: env_parse("MAX_CONCURRENCY", defaults.max_concurrency)?,
            provider_timeout: env_duration("PROVIDER_TIMEOUT", defaults.provider_timeout)?,
            job_timeout: env_duration("JOB_TIMEOUT", defaults.job_timeout)?,
            lease_duration: env_seconds("LEASE_SECONDS", defaults.lease_duration)?,
            heartbeat_interval: env_seconds("HEARTBEAT_SECONDS", defaults.heartbeat_interval)?,
            idempotency_ttl: env_duration("IDEMPOTENCY_TTL", defaults.idempotency_ttl)?,
            job_ttl: env_duration("JOB_TTL", defaults.job_ttl)?,
            max_attempts: env_parse("JOB_MAX_ATTEMPTS", defaults.max_attempts)?,
            worker_count: env_parse("WORKER_COUNT", defaults.worker_count)?,
            cache_sim_threshold: env_parse("CACHE_SIM_THRESHOLD", defaults.cache_sim_threshold)?,
            past_report_sim_floor: env_parse(
                "PAST_REPORT_SIM_FLOOR",
                defaults.past_report_sim_floor,
            )?,
            vector_dim: env_parse("VECTOR_DIM", defaults.vector_dim)?,
            hybrid_bm25_weight: env_parse("HYBRID_BM25_WEIGHT", defaults.hybrid_bm25_weight)?,
            cache_capacity: env_parse("CACHE_CAPACITY", defaults.cache_capacity)?,
            cache_ttl: env_duration("CACHE_TTL", defaults.cache_ttl)?,
            max_document_bytes: env_parse("MAX_DOCUMENT_BYTES", defaults.max_document_bytes)?,
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            planning_models: RoleModels {
                low: env_models("PLANNING_MODELS_LOW", defaults.planning_models.low),
                high: env_models("PLANNING_MODELS_HIGH", defaults.planning_models.high),
            },
            research_models: RoleModels {
                low: env_models("RESEARCH_MODELS_LOW", defaults.research_models.low),
                high: env_models("RESEARCH_MODELS_HIGH", defaults.research_models.high),
            },
            synthesis_models: RoleModels {
                low: env_models("SYNTHESIS_MODELS_LOW", defaults.synthesis_models.low),
                high: env_models("SYNTHESIS_MODELS_HIGH", defaults.synthesis_models.high),
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn env_seconds(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{} must be a number of seconds", name))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

/// Parse durations like "24h", "30m", "90s", or a bare number of seconds.
fn env_duration(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            parse_duration(&raw).with_context(|| format!("{} must be a duration like 24h", name))
        }
        Err(_) => Ok(default),
    }
}

fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (value, multiplier) = match raw.chars().last() {
        Some('h') => (&raw[..raw.len() - 1], 3600),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('s') => (&raw[..raw.len() - 1], 1),
        _ => (raw, 1),
    };
    let value: u64 = value
        .parse()
        .with_context(|| format!("invalid duration: {}", raw))?;
    Ok(Duration::from_secs(value * multiplier))
}

fn env_models(name: &str, default: Vec<String>) -> Vec<String> {
    match env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}
