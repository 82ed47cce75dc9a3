// Kernel - core infrastructure with dependency injection
//
// The ResearchKernel holds all server dependencies (knowledge base, provider
// gateway, semantic cache, job infrastructure, stream hub, bounded executor)
// and provides access behind traits for testability.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in the `domains` layer.

pub mod cache;
pub mod executor;
pub mod gateway;
pub mod jobs;
pub mod kb;
pub mod stream_hub;
pub mod test_dependencies;
pub mod traits;

pub use cache::{CachedReport, SemanticCache};
pub use executor::{BoundedExecutor, ExecutorConfig};
pub use gateway::{AgentRole, ChatOptions, CostPreference, GatewayConfig, ProviderGateway};
pub use kb::{KnowledgeBase, SearchHit, SearchScope};
pub use stream_hub::StreamHub;
pub use traits::BaseChatProvider;

use std::sync::Arc;

use tracing::warn;

use crate::common::error::Result;
use crate::config::Config;
use jobs::{JobManager, SqliteJobStore};

/// ResearchKernel holds all server dependencies
pub struct ResearchKernel {
    pub config: Config,
    pub kb: KnowledgeBase,
    pub cache: SemanticCache,
    pub gateway: ProviderGateway,
    pub executor: BoundedExecutor,
    pub hub: StreamHub,
    pub jobs: Arc<JobManager>,
}

impl ResearchKernel {
    /// Build the kernel against the configured on-disk knowledge base
    /// (falling back to in-memory mode if it cannot be opened).
    pub async fn new(config: Config, provider: Arc<dyn BaseChatProvider>) -> Result<Self> {
        let kb = KnowledgeBase::open(
            &config.kb_path,
            config.vector_dim,
            config.hybrid_bm25_weight,
        )
        .await?;
        Self::assemble(config, provider, kb).await
    }

    /// Build a fully in-memory kernel (tests).
    pub async fn in_memory(config: Config, provider: Arc<dyn BaseChatProvider>) -> Result<Self> {
        let kb = KnowledgeBase::in_memory(config.vector_dim, config.hybrid_bm25_weight).await?;
        Self::assemble(config, provider, kb).await
    }

    async fn assemble(
        config: Config,
        provider: Arc<dyn BaseChatProvider>,
        kb: KnowledgeBase,
    ) -> Result<Self> {
        let hub = StreamHub::new();
        let store = SqliteJobStore::new(kb.pool().clone());
        let jobs = Arc::new(JobManager::new(store, hub.clone(), &config));

        let cache = SemanticCache::new(
            config.cache_sim_threshold,
            config.cache_capacity,
            config.cache_ttl,
        );
        match kb.load_cache_entries(config.cache_capacity as i64).await {
            Ok(entries) => {
                for entry in entries {
                    cache.insert_entry(entry);
                }
            }
            Err(e) => warn!(error = %e, "failed to warm-load semantic cache"),
        }

        let gateway = ProviderGateway::new(provider, GatewayConfig::from_config(&config));

        let executor = BoundedExecutor::new(ExecutorConfig {
            max_concurrency: config.max_concurrency,
            initial_concurrency: (config.max_concurrency / 2).max(1),
            queue_capacity: 64,
            task_timeout: config.provider_timeout,
            increase_after: 3,
        });

        Ok(Self {
            config,
            kb,
            cache,
            gateway,
            executor,
            hub,
            jobs,
        })
    }

    /// Health flag: false when the KB fell back to in-memory mode.
    pub fn is_durable(&self) -> bool {
        self.kb.is_durable()
    }
}
