//! Heartbeats are the command channel: at-most-once hand-out, busy
//! back-pressure, and replay safety.

mod common;

use axum::http::StatusCode;
use common::{catalog_for_single_run, make_server, single_run_config, test_settings};

#[tokio::test(flavor = "multi_thread")]
async fn queued_command_is_handed_out_exactly_once() {
    let server = make_server(test_settings(), catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;
    let campaign_id = server.start_campaign("a1", single_run_config()).await;

    let command = server.heartbeat_until_command("a1", &token).await;
    let command_id = command["command_id"].as_str().unwrap().to_string();
    assert_eq!(command["type"], "run_container");
    assert_eq!(command["payload"]["model_ref"], "qwen2:7b");
    assert_eq!(command["payload"]["benchmark_name"], "throughput");

    // Replaying the heartbeat with no new command returns null, both times.
    assert!(server.heartbeat("a1", &token).await.is_null());
    assert!(server.heartbeat("a1", &token).await.is_null());

    // The run is now dispatched in the ledger.
    let (_, snap) = server
        .call("GET", &format!("/api/v1/campaigns/{campaign_id}"), None, None)
        .await;
    assert_eq!(snap["runs"][0]["status"], "dispatched");
    assert_eq!(snap["runs"][0]["command_id"], command_id.as_str());
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_agent_gets_no_command() {
    let server = make_server(test_settings(), catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;
    server.start_campaign("a1", single_run_config()).await;

    // Give the executor a moment to enqueue.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    // Busy heartbeat: active_commands non-empty ⇒ command must stay queued.
    let (status, body) = server
        .call(
            "POST",
            "/api/v1/agents/a1/heartbeat",
            Some(&token),
            Some(serde_json::json!({
                "capabilities": {"cpu_arch": "amd64"},
                "active_commands": ["some-other-command"]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["command"].is_null());

    // Once idle, the same command is delivered.
    let command = server.heartbeat_until_command("a1", &token).await;
    assert_eq!(command["type"], "run_container");
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_refreshes_liveness_and_capabilities() {
    let server = make_server(test_settings(), catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;

    let (status, _) = server
        .call(
            "POST",
            "/api/v1/agents/a1/heartbeat",
            Some(&token),
            Some(serde_json::json!({
                "capabilities": {
                    "cpu_arch": "arm64",
                    "gpu_info": "GH200 (96GB)",
                    "gpu_count": 1,
                    "ram_gb": 480,
                    "kitt_version": "0.2.0"
                },
                "active_commands": []
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, agents) = server.call("GET", "/api/v1/agents", None, None).await;
    let row = &agents.as_array().unwrap()[0];
    assert_eq!(row["status"], "online");
    assert_eq!(row["cpu_arch"], "arm64");
    assert_eq!(row["gpu_info"], "GH200 (96GB)");
    assert_eq!(row["ram_gb"], 480);
    assert!(!row["last_heartbeat"].is_null());
}
