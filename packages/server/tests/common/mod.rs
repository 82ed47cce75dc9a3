//! Shared harness for integration tests: an in-memory kernel wired to the
//! scripted provider, plus event-stream helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use research_core::kernel::jobs::{ResearchWorker, WorkerConfig};
use research_core::kernel::test_dependencies::{ScriptedProvider, MOCK_EMBED_DIM};
use research_core::kernel::{BaseChatProvider, ResearchKernel};
use research_core::tools;
use research_core::Config;

pub struct TestHarness {
    pub kernel: Arc<ResearchKernel>,
    pub provider: Arc<ScriptedProvider>,
}

/// Config tuned for fast tests: mock embedding dimension, short lease and
/// heartbeat intervals.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.vector_dim = MOCK_EMBED_DIM;
    config.lease_duration = Duration::from_secs(5);
    config.heartbeat_interval = Duration::from_millis(100);
    config.provider_timeout = Duration::from_secs(5);
    config.job_timeout = Duration::from_secs(20);
    config
}

pub async fn harness() -> TestHarness {
    harness_with_config(test_config()).await
}

pub async fn harness_with_config(config: Config) -> TestHarness {
    let provider = Arc::new(ScriptedProvider::new());
    let kernel = ResearchKernel::in_memory(
        config,
        Arc::clone(&provider) as Arc<dyn BaseChatProvider>,
    )
    .await
    .expect("in-memory kernel");
    TestHarness {
        kernel: Arc::new(kernel),
        provider,
    }
}

/// Harness backed by an on-disk KB (restart tests).
pub async fn durable_harness(kb_path: &str) -> TestHarness {
    let mut config = test_config();
    config.kb_path = kb_path.to_string();
    let provider = Arc::new(ScriptedProvider::new());
    let kernel = ResearchKernel::new(
        config,
        Arc::clone(&provider) as Arc<dyn BaseChatProvider>,
    )
    .await
    .expect("durable kernel");
    TestHarness {
        kernel: Arc::new(kernel),
        provider,
    }
}

impl TestHarness {
    pub fn worker(&self, worker_id: &str) -> ResearchWorker {
        ResearchWorker::new(
            Arc::clone(&self.kernel),
            WorkerConfig::from_config(&self.kernel.config).with_worker_id(worker_id),
        )
    }

    /// Call a tool and parse its JSON text body.
    pub async fn call_tool(&self, tool: &str, args: serde_json::Value) -> serde_json::Value {
        let response = tools::dispatch(&self.kernel, tool, args).await;
        assert!(
            !response.is_error(),
            "tool {} failed: {}",
            tool,
            response.first_text()
        );
        serde_json::from_str(response.first_text()).expect("tool response is JSON")
    }

    /// Call a tool expecting failure; returns the error line.
    pub async fn call_tool_err(&self, tool: &str, args: serde_json::Value) -> String {
        let response = tools::dispatch(&self.kernel, tool, args).await;
        assert!(response.is_error(), "tool {} unexpectedly succeeded", tool);
        response.first_text().to_string()
    }

    /// Submit a research job through the tool surface; returns the job id.
    pub async fn submit(&self, args: serde_json::Value) -> Uuid {
        let body = self.call_tool("submit_research", args).await;
        body["jobId"]
            .as_str()
            .expect("jobId present")
            .parse()
            .expect("jobId is a uuid")
    }

    /// Lease and execute exactly one job to completion on a one-shot worker.
    pub async fn drive_one_job(&self, worker_id: &str) {
        let job = self
            .kernel
            .jobs
            .lease(
                &["research".to_string()],
                worker_id,
                self.kernel.config.lease_duration,
            )
            .await
            .expect("lease query")
            .expect("a queued job to lease");
        self.worker(worker_id)
            .process(job, &CancellationToken::new())
            .await;
    }

    /// Replay the persisted event types for a job, in order.
    pub async fn event_types(&self, job_id: Uuid) -> Vec<String> {
        self.kernel
            .jobs
            .events(job_id, 0, 1000)
            .await
            .expect("events")
            .iter()
            .map(|record| record.event.event_type())
            .collect()
    }
}

/// Wait until the live stream delivers an event of the given type.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<serde_json::Value>,
    event_type: &str,
    timeout: Duration,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for event");
        let value = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if value["event"]["type"] == event_type
            || value["event"]["type"]
                .as_str()
                .map(|t| {
                    format!(
                        "{}:{}",
                        t,
                        value["event"]["phase"].as_str().unwrap_or_default()
                    )
                })
                .as_deref()
                == Some(event_type)
        {
            return value;
        }
    }
}

/// A scripted plan with the given sub-queries.
pub fn plan_json(queries: &[&str], complete: bool) -> String {
    let sub_queries: Vec<serde_json::Value> = queries
        .iter()
        .map(|q| serde_json::json!({"query": q, "role": "general"}))
        .collect();
    serde_json::json!({"sub_queries": sub_queries, "complete": complete}).to_string()
}
