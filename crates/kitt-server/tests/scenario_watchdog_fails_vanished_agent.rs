//! An agent that takes a command and disappears: the per-run watchdog fails
//! the run after the timeout and the march continues.

mod common;

use std::time::Duration;

use common::{catalog_for_single_run, make_server, single_run_config, test_settings};

#[tokio::test(flavor = "multi_thread")]
async fn dispatched_run_without_status_fails_as_watchdog() {
    let mut settings = test_settings();
    settings.run_timeout = Duration::from_secs(2);
    let server = make_server(settings, catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;
    let campaign_id = server.start_campaign("a1", single_run_config()).await;

    // Agent picks up the command, then vanishes: no status, no result.
    let command = server.heartbeat_until_command("a1", &token).await;
    assert!(!command.is_null());

    let snap = server.wait_for_campaign_terminal(&campaign_id).await;
    assert_eq!(snap["status"], "completed");
    assert_eq!(snap["aggregates"]["failed"], 1);
    assert_eq!(snap["runs"][0]["status"], "failed");
    assert_eq!(snap["runs"][0]["error_kind"], "watchdog");
}

#[tokio::test(flavor = "multi_thread")]
async fn late_result_after_watchdog_is_absorbed_as_duplicate() {
    let mut settings = test_settings();
    settings.run_timeout = Duration::from_secs(2);
    let server = make_server(settings, catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;
    let campaign_id = server.start_campaign("a1", single_run_config()).await;

    let command = server.heartbeat_until_command("a1", &token).await;
    let command_id = command["command_id"].as_str().unwrap().to_string();

    let snap = server.wait_for_campaign_terminal(&campaign_id).await;
    assert_eq!(snap["runs"][0]["status"], "failed");

    // The lost agent finally reports, too late: no side effects.
    let (status, body) = server
        .call(
            "POST",
            "/api/v1/agents/a1/results",
            Some(&token),
            Some(serde_json::json!({
                "command_id": command_id,
                "status": "completed",
                "metrics": {},
                "hardware": {}
            })),
        )
        .await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["duplicate"], true);

    let (_, after) = server
        .call("GET", &format!("/api/v1/campaigns/{campaign_id}"), None, None)
        .await;
    assert_eq!(after["runs"][0]["status"], "failed");
    assert_eq!(after["aggregates"]["failed"], 1);
    assert_eq!(after["aggregates"]["succeeded"], 0);
    assert_eq!(after["runs"][0]["error_kind"], "watchdog");
}
