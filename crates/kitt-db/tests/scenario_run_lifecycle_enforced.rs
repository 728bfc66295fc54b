//! Run status transitions are compare-and-set: stale writers lose, terminal
//! states are immutable, and exactly one terminal transition wins.

mod common;

use kitt_db::{TransitionFields, TransitionOutcome};
use kitt_schemas::{ErrorKind, RunStatus};

async fn insert_one_run(pool: &sqlx::SqlitePool) -> String {
    let campaign_id = common::insert_campaign(pool).await;
    let run = common::planned_run(0, "Q4_K_M", "throughput");
    let run_id = run.id.clone();
    kitt_db::insert_planned_runs(pool, &campaign_id, &[run])
        .await
        .unwrap();
    run_id
}

#[tokio::test]
async fn happy_path_walks_the_lifecycle() {
    let (_dir, pool) = common::test_pool().await;
    let run_id = insert_one_run(&pool).await;

    let steps = [
        (RunStatus::Pending, RunStatus::Queued),
        (RunStatus::Queued, RunStatus::Dispatched),
        (RunStatus::Dispatched, RunStatus::Running),
        (RunStatus::Running, RunStatus::Completed),
    ];
    for (from, to) in steps {
        let outcome = kitt_db::transition_run(&pool, &run_id, from, to, TransitionFields::default())
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied, "{from:?} -> {to:?}");
    }

    let run = kitt_db::fetch_run(&pool, &run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.queued_at.is_some());
    assert!(run.dispatched_at.is_some());
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn stale_writer_gets_conflict() {
    let (_dir, pool) = common::test_pool().await;
    let run_id = insert_one_run(&pool).await;

    kitt_db::transition_run(
        &pool,
        &run_id,
        RunStatus::Pending,
        RunStatus::Queued,
        TransitionFields::default(),
    )
    .await
    .unwrap();

    // A second writer still believing the run is pending loses the race.
    let outcome = kitt_db::transition_run(
        &pool,
        &run_id,
        RunStatus::Pending,
        RunStatus::Queued,
        TransitionFields::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, TransitionOutcome::Conflict);
}

#[tokio::test]
async fn terminal_states_are_immutable() {
    let (_dir, pool) = common::test_pool().await;
    let run_id = insert_one_run(&pool).await;

    kitt_db::transition_run(
        &pool,
        &run_id,
        RunStatus::Pending,
        RunStatus::Failed,
        TransitionFields {
            error_kind: Some(ErrorKind::Watchdog),
            error: Some("no status within the per-run timeout".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // No transition out of a terminal state, whatever the target.
    for to in [RunStatus::Running, RunStatus::Completed, RunStatus::Cancelled] {
        let outcome = kitt_db::transition_run(
            &pool,
            &run_id,
            RunStatus::Failed,
            to,
            TransitionFields::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, TransitionOutcome::Conflict, "-> {to:?}");
    }

    let run = kitt_db::fetch_run(&pool, &run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_kind, Some(ErrorKind::Watchdog));
}

#[tokio::test]
async fn command_id_is_set_when_leaving_pending_and_sticks() {
    let (_dir, pool) = common::test_pool().await;
    let run_id = insert_one_run(&pool).await;

    kitt_db::transition_run(
        &pool,
        &run_id,
        RunStatus::Pending,
        RunStatus::Queued,
        TransitionFields {
            command_id: Some("cmd-1".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Later transitions without a command_id keep the original.
    kitt_db::transition_run(
        &pool,
        &run_id,
        RunStatus::Queued,
        RunStatus::Dispatched,
        TransitionFields::default(),
    )
    .await
    .unwrap();

    let run = kitt_db::fetch_run(&pool, &run_id).await.unwrap().unwrap();
    assert_eq!(run.command_id.as_deref(), Some("cmd-1"));

    let by_command = kitt_db::fetch_run_by_command(&pool, "cmd-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_command.id, run_id);
}

#[tokio::test]
async fn aggregates_are_derived_from_run_rows() {
    let (_dir, pool) = common::test_pool().await;
    let campaign_id = common::insert_campaign(&pool).await;

    let runs = vec![
        common::planned_run(0, "Q2_K", "throughput"),
        common::planned_run(1, "Q4_K_M", "throughput"),
        common::planned_run(2, "Q8_0", "throughput"),
    ];
    let ids: Vec<String> = runs.iter().map(|r| r.id.clone()).collect();
    kitt_db::insert_planned_runs(&pool, &campaign_id, &runs)
        .await
        .unwrap();

    kitt_db::transition_run(
        &pool,
        &ids[0],
        RunStatus::Pending,
        RunStatus::Completed,
        TransitionFields::default(),
    )
    .await
    .unwrap();
    kitt_db::transition_run(
        &pool,
        &ids[1],
        RunStatus::Pending,
        RunStatus::Failed,
        TransitionFields::default(),
    )
    .await
    .unwrap();

    let agg = kitt_db::snapshot_campaign(&pool, &campaign_id).await.unwrap();
    assert_eq!(agg.total_runs, 3);
    assert_eq!(agg.succeeded, 1);
    assert_eq!(agg.failed, 1);
    assert_eq!(agg.pending_or_running, 1);
    assert_eq!(
        agg.total_runs,
        agg.succeeded + agg.failed + agg.skipped + agg.cancelled + agg.pending_or_running
    );
}
