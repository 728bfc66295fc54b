//! Crash recovery: a second server instance over the same ledger resumes
//! open campaigns, watchdogs orphaned in-flight runs, and finishes the
//! march.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{catalog_for_single_run, make_server, single_run_config, test_settings};
use kitt_server::{recovery, state::AppState};

#[tokio::test(flavor = "multi_thread")]
async fn dispatched_run_is_watchdogged_after_restart() {
    let mut settings = test_settings();
    settings.run_timeout = Duration::from_secs(2);
    let server = make_server(settings.clone(), catalog_for_single_run()).await;
    let (_, token) = server.provision_agent("a1").await;
    let campaign_id = server.start_campaign("a1", single_run_config()).await;

    // Agent takes the command; then the "server" dies: abort all executors
    // and drop the dispatch state by building a fresh AppState on the same
    // database.
    let command = server.heartbeat_until_command("a1", &token).await;
    assert!(!command.is_null());
    server.state.executors.abort_all();

    let restarted = AppState::with_catalog(
        server.state.db.clone(),
        settings,
        Arc::new(catalog_for_single_run()),
    );
    recovery::recover(&restarted).await.unwrap();

    // The resumed executor watchdogs the orphaned run and finishes.
    for _ in 0..100 {
        let campaign = kitt_db::fetch_campaign(&restarted.db, &campaign_id)
            .await
            .unwrap()
            .unwrap();
        if campaign.status.is_terminal() {
            let agg = kitt_db::snapshot_campaign(&restarted.db, &campaign_id)
                .await
                .unwrap();
            assert_eq!(agg.failed, 1);
            assert_eq!(agg.pending_or_running, 0);
            let runs = kitt_db::list_runs(&restarted.db, &campaign_id).await.unwrap();
            assert_eq!(runs[0].error_kind, Some(kitt_schemas::ErrorKind::Watchdog));
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("campaign did not settle after restart");
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_agents_are_demoted_on_startup() {
    let settings = test_settings();
    let server = make_server(settings.clone(), catalog_for_single_run()).await;
    let (agent_id, token) = server.provision_agent("a1").await;
    server.heartbeat("a1", &token).await;

    // Backdate the heartbeat past the liveness window.
    sqlx::query("UPDATE agents SET last_heartbeat = ?1 WHERE id = ?2")
        .bind(chrono::Utc::now() - chrono::Duration::hours(1))
        .bind(&agent_id)
        .execute(&server.state.db)
        .await
        .unwrap();

    recovery::recover(&server.state).await.unwrap();

    let agent = kitt_db::fetch_agent(&server.state.db, &agent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.status, "offline");
}
