// Main entry point for the deep-research orchestration server.
//
// Boots the kernel (knowledge base, provider gateway, job infrastructure),
// starts the research workers and the TTL cleanup loop, and waits for
// shutdown. Tool-call protocol adapters (stdio / streamable HTTP) are wired
// externally against `research_core::tools::dispatch`.

use std::sync::Arc;

use anyhow::{Context, Result};
use openrouter_client::OpenRouterClient;
use research_core::kernel::jobs::{ResearchWorker, WorkerConfig};
use research_core::kernel::ResearchKernel;
use research_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,research_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting deep research orchestration server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Build the kernel (opens the knowledge base, runs migrations)
    let provider = Arc::new(OpenRouterClient::new(config.openrouter_api_key.clone()));
    let kernel = Arc::new(
        ResearchKernel::new(config.clone(), provider)
            .await
            .context("Failed to build kernel")?,
    );
    if kernel.is_durable() {
        tracing::info!(path = %config.kb_path, "Knowledge base ready");
    } else {
        tracing::warn!("Knowledge base in volatile in-memory mode; reports will not survive restart");
    }

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    // TTL cleanup loop
    {
        let jobs = Arc::clone(&kernel.jobs);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            jobs.run_cleanup_loop(shutdown).await;
        }));
    }

    // Research workers
    for i in 0..config.worker_count.max(1) {
        let worker = ResearchWorker::new(
            Arc::clone(&kernel),
            WorkerConfig::from_config(&config).with_worker_id(format!("worker-{}", i)),
        );
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker.run(shutdown).await;
        }));
    }

    tracing::info!(
        workers = config.worker_count.max(1),
        "Server ready; waiting for tool-call submissions"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining workers");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
