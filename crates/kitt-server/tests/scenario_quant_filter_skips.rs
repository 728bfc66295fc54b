//! Campaign quant filters applied through the full start path.

mod common;

use common::{make_server, test_settings};
use kitt_planner::StaticCatalog;

#[tokio::test(flavor = "multi_thread")]
async fn skip_patterns_remove_discovered_quants() {
    let catalog = StaticCatalog::new().with_repo_files(
        "org/llama3-gguf",
        &[
            "llama3-Q2_K.gguf",
            "llama3-Q4_K_M.gguf",
            "llama3-Q8_0.gguf",
        ],
    );
    let server = make_server(test_settings(), catalog).await;
    server.provision_agent("a1").await;

    let campaign_id = server
        .start_campaign(
            "a1",
            serde_json::json!({
                "name": "filtered",
                "models": [{"name": "llama3", "params": "8B", "gguf_repo": "org/llama3-gguf"}],
                "engines": [{"name": "llama_cpp", "suite": "quick"}],
                "benchmarks": ["throughput"],
                "quant_filter": {"skip_patterns": ["Q2_*"], "include_only": []}
            }),
        )
        .await;

    let (_, snap) = server
        .call("GET", &format!("/api/v1/campaigns/{campaign_id}"), None, None)
        .await;
    let quants: Vec<&str> = snap["runs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["quant"].as_str().unwrap())
        .collect();
    assert_eq!(quants.len(), 2);
    assert!(quants.contains(&"Q4_K_M"));
    assert!(quants.contains(&"Q8_0"));
    assert!(!quants.contains(&"Q2_K"));
}

#[tokio::test(flavor = "multi_thread")]
async fn replanning_by_restarting_is_absorbed() {
    // Starting twice is a conflict; the second plan attempt must not
    // duplicate runs even at the ledger level.
    let catalog = StaticCatalog::new()
        .with_repo_files("org/llama3-gguf", &["llama3-Q4_K_M.gguf"]);
    let server = make_server(test_settings(), catalog).await;
    server.provision_agent("a1").await;

    let campaign_id = server
        .start_campaign(
            "a1",
            serde_json::json!({
                "name": "replan",
                "models": [{"name": "llama3", "params": "8B", "gguf_repo": "org/llama3-gguf"}],
                "engines": [{"name": "llama_cpp", "suite": "quick"}],
                "benchmarks": ["throughput"]
            }),
        )
        .await;

    let (status, _) = server
        .call(
            "POST",
            &format!("/api/v1/campaigns/{campaign_id}/start"),
            None,
            None,
        )
        .await;
    assert_eq!(status, axum::http::StatusCode::CONFLICT);

    let runs = kitt_db::list_runs(&server.state.db, &campaign_id).await.unwrap();
    assert_eq!(runs.len(), 1);
}
