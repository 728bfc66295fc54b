//! A duplicate terminal report is acknowledged but changes nothing.

mod common;

use axum::http::StatusCode;
use common::{catalog_for_single_run, make_server, single_run_config, test_settings};
use kitt_schemas::RunStatus;

#[tokio::test(flavor = "multi_thread")]
async fn second_result_report_is_a_noop() {
    let server = make_server(test_settings(), catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;
    let campaign_id = server.start_campaign("a1", single_run_config()).await;

    let command = server.heartbeat_until_command("a1", &token).await;
    let command_id = command["command_id"].as_str().unwrap().to_string();
    server
        .complete_command("a1", &token, &command_id, RunStatus::Completed)
        .await;
    let first = server.wait_for_campaign_terminal(&campaign_id).await;

    // Replay the exact terminal report.
    let (status, body) = server
        .call(
            "POST",
            "/api/v1/agents/a1/results",
            Some(&token),
            Some(serde_json::json!({
                "command_id": command_id,
                "status": "completed",
                "metrics": {"tokens_per_second": 99999.0},
                "hardware": {}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["duplicate"], true);

    // Ledger state identical to the state after the first report.
    let (_, second) = server
        .call("GET", &format!("/api/v1/campaigns/{campaign_id}"), None, None)
        .await;
    assert_eq!(first["aggregates"], second["aggregates"]);
    assert_eq!(first["runs"], second["runs"]);

    // A contradictory replay (failed after completed) is also absorbed.
    let (status, body) = server
        .call(
            "POST",
            "/api/v1/agents/a1/results",
            Some(&token),
            Some(serde_json::json!({
                "command_id": command_id,
                "status": "failed",
                "error": "late duplicate",
                "metrics": {},
                "hardware": {}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);

    let (_, third) = server
        .call("GET", &format!("/api/v1/campaigns/{campaign_id}"), None, None)
        .await;
    assert_eq!(second["aggregates"], third["aggregates"]);
    assert_eq!(third["runs"][0]["status"], "completed");
}

#[tokio::test(flavor = "multi_thread")]
async fn result_for_unknown_command_is_404() {
    let server = make_server(test_settings(), catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;

    let (status, body) = server
        .call(
            "POST",
            "/api/v1/agents/a1/results",
            Some(&token),
            Some(serde_json::json!({
                "command_id": "never-issued",
                "status": "completed",
                "metrics": {},
                "hardware": {}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn incompatible_architecture_reports_become_skips() {
    let server = make_server(test_settings(), catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;
    let campaign_id = server.start_campaign("a1", single_run_config()).await;

    let command = server.heartbeat_until_command("a1", &token).await;
    let command_id = command["command_id"].as_str().unwrap();

    let (status, _) = server
        .call(
            "POST",
            "/api/v1/agents/a1/results",
            Some(&token),
            Some(serde_json::json!({
                "command_id": command_id,
                "status": "failed",
                "error": "incompatible_architecture: image is amd64, host is arm64",
                "error_kind": "incompatible",
                "metrics": {},
                "hardware": {}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let snap = server.wait_for_campaign_terminal(&campaign_id).await;
    assert_eq!(snap["runs"][0]["status"], "skipped");
    assert_eq!(snap["runs"][0]["error_kind"], "incompatible");
    assert_eq!(snap["aggregates"]["skipped"], 1);
    assert_eq!(snap["aggregates"]["failed"], 0);
}
