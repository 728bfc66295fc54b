//! Shared helpers for ledger scenario tests: a throwaway SQLite file per
//! test, plus fixture rows.

use chrono::Utc;
use kitt_schemas::{EngineMode, RunStatus};
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.db");
    let pool = kitt_db::connect(path.to_str().expect("utf8 path"))
        .await
        .expect("connect test ledger");
    (dir, pool)
}

pub async fn insert_campaign(pool: &SqlitePool) -> String {
    let campaign = kitt_db::NewCampaign {
        id: Uuid::new_v4().to_string(),
        name: "test-campaign".to_string(),
        config_json: serde_json::json!({"name": "test-campaign"}),
        config_hash: "deadbeef".to_string(),
        agent_id: None,
        created_at: Utc::now(),
    };
    kitt_db::create_campaign(pool, &campaign)
        .await
        .expect("create campaign");
    campaign.id
}

pub fn planned_run(order: i64, quant: &str, benchmark: &str) -> kitt_db::NewPlannedRun {
    kitt_db::NewPlannedRun {
        id: Uuid::new_v4().to_string(),
        plan_order: order,
        model_name: "llama3".to_string(),
        model_ref: "org/llama3-gguf".to_string(),
        engine_name: "llama_cpp".to_string(),
        engine_mode: EngineMode::Docker,
        benchmark_name: benchmark.to_string(),
        suite_name: "quick".to_string(),
        quant: quant.to_string(),
        include_pattern: None,
        estimated_size_gb: 4.5,
        status: RunStatus::Pending,
        error_kind: None,
        error: None,
    }
}
