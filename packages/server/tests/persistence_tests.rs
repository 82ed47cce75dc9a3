//! Durability tests: reports and jobs survive a process restart when the
//! knowledge base lives on disk.

mod common;

use common::{durable_harness, plan_json};
use serde_json::json;

#[tokio::test]
async fn report_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let kb_path = dir.path().to_str().unwrap().to_string();

    let report_id = {
        let h = durable_harness(&kb_path).await;
        assert!(h.kernel.is_durable());

        h.provider.push_structured_ok(plan_json(&["sub"], true));
        h.provider
            .push_chat_ok("Helsinki is the capital of Finland.");
        h.provider
            .push_stream(&["Helsinki is the capital of Finland."]);

        let job_id = h.submit(json!({"query": "capital of Finland"})).await;
        h.drive_one_job("w1").await;

        let job = h.kernel.jobs.get(job_id).await.unwrap();
        job.result.unwrap()["reportId"]
            .as_str()
            .unwrap()
            .to_string()
        // Kernel (and its pool) drops here: the "process" exits.
    };

    let restarted = durable_harness(&kb_path).await;
    let report = restarted
        .call_tool("get_report", json!({"reportId": report_id}))
        .await;
    assert!(report["content"].as_str().unwrap().contains("Helsinki"));
}

#[tokio::test]
async fn queued_job_survives_restart_and_still_runs() {
    let dir = tempfile::tempdir().unwrap();
    let kb_path = dir.path().to_str().unwrap().to_string();

    let job_id = {
        let h = durable_harness(&kb_path).await;
        h.submit(json!({"query": "finish me after restart"})).await
    };

    let restarted = durable_harness(&kb_path).await;
    restarted.provider.push_structured_ok(plan_json(&["sub"], true));
    restarted.provider.push_stream(&["Completed after restart."]);
    restarted.drive_one_job("w-after-restart").await;

    let job = restarted.kernel.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status.as_str(), "succeeded");
}

#[tokio::test]
async fn semantic_cache_entries_are_warm_loaded_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let kb_path = dir.path().to_str().unwrap().to_string();

    {
        let h = durable_harness(&kb_path).await;
        h.provider.push_structured_ok(plan_json(&["sub"], true));
        h.provider.push_stream(&["Cached answer."]);
        h.submit(json!({"query": "warm cache query"})).await;
        h.drive_one_job("w1").await;
        assert_eq!(h.kernel.cache.len(), 1);
    };

    let restarted = durable_harness(&kb_path).await;
    assert_eq!(restarted.kernel.cache.len(), 1);

    // A repeat submission after restart short-circuits on the cache.
    let job_id = restarted.submit(json!({"query": "warm cache query"})).await;
    restarted.drive_one_job("w2").await;

    let types = restarted.event_types(job_id).await;
    assert!(types.contains(&"cache_hit".to_string()));
    assert_eq!(restarted.provider.chat_calls(), 0);
}
