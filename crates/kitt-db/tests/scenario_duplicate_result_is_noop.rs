//! Results are written once. A duplicate report leaves the ledger exactly
//! as the first one did.

mod common;

use kitt_db::{NewResult, TransitionFields, TransitionOutcome};
use kitt_schemas::RunStatus;

#[tokio::test]
async fn second_result_insert_is_ignored() {
    let (_dir, pool) = common::test_pool().await;
    let campaign_id = common::insert_campaign(&pool).await;
    let run = common::planned_run(0, "Q4_K_M", "throughput");
    let run_id = run.id.clone();
    kitt_db::insert_planned_runs(&pool, &campaign_id, &[run])
        .await
        .unwrap();

    let result = NewResult {
        run_id: run_id.clone(),
        command_id: "cmd-1".to_string(),
        passed: true,
        metrics_json: serde_json::json!({"tokens_per_second": 42.5}),
        output_location: "kitt-results/run-1".to_string(),
        hardware_json: serde_json::json!({"gpu": "A6000"}),
    };
    assert!(kitt_db::insert_result(&pool, &result).await.unwrap());

    // Replay with different content: ignored, first write wins.
    let replay = NewResult {
        metrics_json: serde_json::json!({"tokens_per_second": 0.0}),
        passed: false,
        ..result.clone()
    };
    assert!(!kitt_db::insert_result(&pool, &replay).await.unwrap());

    let (passed, metrics): (bool, serde_json::Value) =
        sqlx::query_as("SELECT passed, metrics_json FROM run_results WHERE run_id = ?1")
            .bind(&run_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(passed);
    assert_eq!(metrics["tokens_per_second"], 42.5);
}

#[tokio::test]
async fn duplicate_terminal_transition_is_a_conflict_not_a_change() {
    let (_dir, pool) = common::test_pool().await;
    let campaign_id = common::insert_campaign(&pool).await;
    let run = common::planned_run(0, "Q4_K_M", "throughput");
    let run_id = run.id.clone();
    kitt_db::insert_planned_runs(&pool, &campaign_id, &[run])
        .await
        .unwrap();

    for (from, to) in [
        (RunStatus::Pending, RunStatus::Queued),
        (RunStatus::Queued, RunStatus::Dispatched),
        (RunStatus::Dispatched, RunStatus::Running),
        (RunStatus::Running, RunStatus::Completed),
    ] {
        kitt_db::transition_run(&pool, &run_id, from, to, TransitionFields::default())
            .await
            .unwrap();
    }
    let after_first = kitt_db::snapshot_campaign(&pool, &campaign_id).await.unwrap();

    // The "second report": same terminal transition again.
    let outcome = kitt_db::transition_run(
        &pool,
        &run_id,
        RunStatus::Running,
        RunStatus::Completed,
        TransitionFields::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, TransitionOutcome::Conflict);

    let after_second = kitt_db::snapshot_campaign(&pool, &campaign_id).await.unwrap();
    assert_eq!(after_first.succeeded, after_second.succeeded);
    assert_eq!(after_first.total_runs, after_second.total_runs);
}
