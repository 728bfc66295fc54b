//! Cancellation mid-campaign: completed runs keep their results, the rest
//! are marked cancelled, and the executor exits in bounded time.

mod common;

use axum::http::StatusCode;
use common::{make_server, test_settings};
use kitt_planner::StaticCatalog;
use kitt_schemas::RunStatus;

/// One model, one engine, five benchmarks ⇒ five serial runs.
fn five_run_config() -> serde_json::Value {
    serde_json::json!({
        "name": "cancel-me",
        "models": [{"name": "qwen2", "params": "7B", "ollama_tag": "qwen2:7b"}],
        "engines": [{"name": "ollama", "suite": "quick"}],
        "benchmarks": ["throughput", "latency", "memory", "streaming", "warmup"]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_after_two_runs_cancels_the_remaining_three() {
    let catalog = StaticCatalog::new().with_ollama_tags("qwen2", &["7b"]);
    let server = make_server(test_settings(), catalog).await;
    let (_, token) = server.provision_agent("a1").await;
    let campaign_id = server.start_campaign("a1", five_run_config()).await;

    // Complete the first two runs as the agent.
    for _ in 0..2 {
        let command = server.heartbeat_until_command("a1", &token).await;
        let command_id = command["command_id"].as_str().unwrap().to_string();
        server
            .complete_command("a1", &token, &command_id, RunStatus::Completed)
            .await;
    }

    // Cancel while the third run is queued (the agent stops heartbeating).
    let (status, body) = server
        .call(
            "POST",
            &format!("/api/v1/campaigns/{campaign_id}/cancel"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "cancelled");

    let snap = server.wait_for_campaign_terminal(&campaign_id).await;
    assert_eq!(snap["status"], "cancelled");
    assert_eq!(snap["aggregates"]["succeeded"], 2);
    assert_eq!(snap["aggregates"]["cancelled"], 3);
    assert_eq!(snap["aggregates"]["failed"], 0);
    assert_eq!(snap["aggregates"]["pending_or_running"], 0);

    // No further command is ever handed out.
    assert!(server.heartbeat("a1", &token).await.is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_terminal_campaign_conflicts() {
    let catalog = StaticCatalog::new().with_ollama_tags("qwen2", &["7b"]);
    let server = make_server(test_settings(), catalog).await;
    server.provision_agent("a1").await;
    let campaign_id = server
        .start_campaign(
            "a1",
            serde_json::json!({
                "name": "tiny",
                "models": [{"name": "qwen2", "params": "7B", "ollama_tag": "qwen2:7b"}],
                "engines": [{"name": "ollama", "suite": "quick"}],
                "benchmarks": ["throughput"]
            }),
        )
        .await;

    let (status, _) = server
        .call(
            "POST",
            &format!("/api/v1/campaigns/{campaign_id}/cancel"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    server.wait_for_campaign_terminal(&campaign_id).await;

    let (status, body) = server
        .call(
            "POST",
            &format!("/api/v1/campaigns/{campaign_id}/cancel"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");
}
