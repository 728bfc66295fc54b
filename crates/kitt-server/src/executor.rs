//! Campaign executor: one long-lived worker per running campaign.
//!
//! The executor owns the march through a campaign's planned runs and nothing
//! else. Runs are processed strictly serially for the campaign's agent; all
//! failure is captured as a value on the run row and never escapes the loop.
//! A registry keyed by campaign id guarantees at most one executor per
//! campaign.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use kitt_schemas::{
    CampaignStatus, Command, CommandPayload, CommandType, ErrorKind, RunStatus, StreamEventKind,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::AppState;

/// How often the wait loop re-reads the ledger when no bus event arrives.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// `campaign_id → worker handle`. Enforces the one-executor-per-campaign
/// invariant.
pub struct ExecutorRegistry {
    inner: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        ExecutorRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn an executor for a campaign unless one is already running.
    /// Returns `false` when the campaign already has a live worker.
    pub fn spawn(&self, state: Arc<AppState>, campaign_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("executor registry lock poisoned");
        if let Some(handle) = inner.get(campaign_id) {
            if !handle.is_finished() {
                return false;
            }
        }

        let id = campaign_id.to_string();
        let id_for_task = id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = run_campaign(state.clone(), &id_for_task).await {
                tracing::error!(campaign = %id_for_task, "campaign executor failed: {e:#}");
                let _ = kitt_db::transition_campaign(
                    &state.db,
                    &id_for_task,
                    CampaignStatus::Running,
                    CampaignStatus::Failed,
                    Some(&format!("{e:#}")),
                )
                .await;
            }
            state.executors.remove(&id_for_task);
            state.bus.gc();
        });
        inner.insert(id, handle);
        true
    }

    pub fn remove(&self, campaign_id: &str) {
        let mut inner = self.inner.lock().expect("executor registry lock poisoned");
        inner.remove(campaign_id);
    }

    /// Abort every worker (shutdown path).
    pub fn abort_all(&self) {
        let mut inner = self.inner.lock().expect("executor registry lock poisoned");
        for (_, handle) in inner.drain() {
            handle.abort();
        }
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Campaign march
// ---------------------------------------------------------------------------

/// Execute (or resume) a campaign to a terminal state.
pub async fn run_campaign(state: Arc<AppState>, campaign_id: &str) -> Result<()> {
    let Some(campaign) = kitt_db::fetch_campaign(&state.db, campaign_id).await? else {
        anyhow::bail!("campaign not found: {campaign_id}");
    };

    let Some(agent_id) = campaign.agent_id.clone() else {
        kitt_db::transition_campaign(
            &state.db,
            campaign_id,
            campaign.status,
            CampaignStatus::Failed,
            Some("campaign has no target agent"),
        )
        .await?;
        return Ok(());
    };

    // queued → running on first start; a resumed campaign is already running.
    if campaign.status == CampaignStatus::Queued {
        kitt_db::transition_campaign(
            &state.db,
            campaign_id,
            CampaignStatus::Queued,
            CampaignStatus::Running,
            None,
        )
        .await?;
        publish_campaign_status(&state, campaign_id, CampaignStatus::Running).await;
    }

    // Resume: any run already handed to the agent gets a watchdog measured
    // from its last transition, then the march continues behind it.
    for run in kitt_db::list_runs_in_flight(&state.db, campaign_id).await? {
        let elapsed = (Utc::now() - run.last_transition_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let remaining = state.settings.run_timeout.saturating_sub(elapsed);
        let total = kitt_db::snapshot_campaign(&state.db, campaign_id).await?.total_runs;
        state
            .publish_log(
                campaign_id,
                format!("Resuming: waiting on in-flight run {} (budget {}s)", run.id, remaining.as_secs()),
            )
            .await?;
        let settled = wait_for_settled(&state, campaign_id, &run.id, remaining).await?;
        state
            .publish_log(
                campaign_id,
                format!("[resume/{}] run {} settled: {}", total, run.id, settled.as_str()),
            )
            .await?;
    }

    let runs = kitt_db::list_runs(&state.db, campaign_id).await?;
    let total = runs.len();
    let pending: Vec<_> = runs
        .iter()
        .filter(|r| r.status == RunStatus::Pending)
        .collect();
    state
        .publish_log(
            campaign_id,
            format!(
                "Campaign started: {} runs planned, {} remaining",
                total,
                pending.len()
            ),
        )
        .await?;

    let mut index = total - pending.len();
    for run in pending {
        index += 1;

        // Cancellation check before every run: cancelled campaigns mark the
        // remaining runs cancelled, never enqueue them.
        if campaign_cancelled(&state, campaign_id).await? {
            let _ = kitt_db::transition_run(
                &state.db,
                &run.id,
                RunStatus::Pending,
                RunStatus::Cancelled,
                kitt_db::TransitionFields::default(),
            )
            .await?;
            continue;
        }

        let label = format!(
            "{} / {} / {} / {}",
            run.model_name, run.engine_name, run.quant, run.benchmark_name
        );
        state
            .publish_log(campaign_id, format!("[{index}/{total}] Queuing: {label}"))
            .await?;

        let command_id = Uuid::new_v4().to_string();
        let command = build_run_command(&campaign.config_json, run, &agent_id, command_id.clone());

        let outcome = kitt_db::transition_run(
            &state.db,
            &run.id,
            RunStatus::Pending,
            RunStatus::Queued,
            kitt_db::TransitionFields {
                command_id: Some(command_id.clone()),
                ..Default::default()
            },
        )
        .await?;
        if outcome != kitt_db::TransitionOutcome::Applied {
            // Lost a race (e.g. concurrent cancel); re-read on next loop.
            continue;
        }
        publish_run_status(&state, &run.id, RunStatus::Queued, None).await;

        if let Err(full) = state.dispatch.enqueue(command) {
            let _ = kitt_db::transition_run(
                &state.db,
                &run.id,
                RunStatus::Queued,
                RunStatus::Failed,
                kitt_db::TransitionFields {
                    error_kind: Some(ErrorKind::TransientRemote),
                    error: Some(full.to_string()),
                    ..Default::default()
                },
            )
            .await?;
            state
                .publish_log(campaign_id, format!("[{index}/{total}] Failed (dispatch queue full)"))
                .await?;
            refresh_aggregates(&state, campaign_id).await?;
            continue;
        }

        state
            .publish_log(
                campaign_id,
                format!("[{index}/{total}] Waiting for agent to pick up test..."),
            )
            .await?;

        let settled =
            wait_for_settled(&state, campaign_id, &run.id, state.settings.run_timeout).await?;

        match settled {
            RunStatus::Completed => {
                state
                    .publish_log(campaign_id, format!("[{index}/{total}] Completed successfully"))
                    .await?;
            }
            RunStatus::Skipped => {
                let run_now = kitt_db::fetch_run(&state.db, &run.id).await?;
                let kind = run_now
                    .and_then(|r| r.error_kind)
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_else(|| "skipped".to_string());
                state
                    .publish_log(campaign_id, format!("[{index}/{total}] Skipped ({kind})"))
                    .await?;
            }
            RunStatus::Cancelled => {
                state
                    .publish_log(campaign_id, format!("[{index}/{total}] Cancelled"))
                    .await?;
            }
            other => {
                let run_now = kitt_db::fetch_run(&state.db, &run.id).await?;
                let kind = run_now
                    .and_then(|r| r.error_kind)
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_else(|| other.as_str().to_string());
                state
                    .publish_log(campaign_id, format!("[{index}/{total}] Failed ({kind})"))
                    .await?;
            }
        }

        refresh_aggregates(&state, campaign_id).await?;
    }

    finalize_campaign(&state, campaign_id).await
}

/// Assemble the dispatch command for a planned run. Also used by the
/// heartbeat handler to rebuild a lost command (same command id) when it
/// requeues an unconfirmed dispatch.
pub fn build_run_command(
    config_json: &serde_json::Value,
    run: &kitt_db::RunRow,
    agent_id: &str,
    command_id: String,
) -> Command {
    Command {
        command_id,
        agent_id: agent_id.to_string(),
        command_type: CommandType::RunContainer,
        payload: CommandPayload {
            model_name: run.model_name.clone(),
            model_ref: run.model_ref.clone(),
            engine_name: run.engine_name.clone(),
            engine_mode: Some(run.engine_mode),
            engine_config: engine_config_from(config_json, &run.engine_name),
            benchmark_name: run.benchmark_name.clone(),
            suite_name: run.suite_name.clone(),
            quant: run.quant.clone(),
            include_pattern: run.include_pattern.clone(),
            target_command_id: None,
        },
        created_at: Utc::now(),
    }
}

/// Pull the matching engine's inline config block out of the campaign
/// config. Absent engines get an empty map.
fn engine_config_from(
    config_json: &serde_json::Value,
    engine_name: &str,
) -> std::collections::BTreeMap<String, serde_json::Value> {
    config_json
        .get("engines")
        .and_then(|e| e.as_array())
        .and_then(|engines| {
            engines
                .iter()
                .find(|e| e.get("name").and_then(|n| n.as_str()) == Some(engine_name))
        })
        .and_then(|e| e.get("config"))
        .and_then(|c| c.as_object())
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

async fn campaign_cancelled(state: &AppState, campaign_id: &str) -> Result<bool> {
    Ok(kitt_db::fetch_campaign(&state.db, campaign_id)
        .await?
        .map(|c| c.status == CampaignStatus::Cancelled)
        .unwrap_or(false))
}

/// Block until the run reaches a terminal status or the budget elapses.
///
/// Wakes on the run's status stream; a timed poll backstops missed events.
/// On budget exhaustion the watchdog fires: the run is failed from whatever
/// non-terminal status it is stuck in. A cancelled campaign cancels the run
/// while it is still `queued`; once dispatched, the agent's report (or the
/// watchdog) settles it.
pub async fn wait_for_settled(
    state: &AppState,
    campaign_id: &str,
    run_id: &str,
    budget: Duration,
) -> Result<RunStatus> {
    let mut sub = state.bus.subscribe(run_id);
    let deadline = tokio::time::Instant::now() + budget;

    loop {
        let Some(run) = kitt_db::fetch_run(&state.db, run_id).await? else {
            anyhow::bail!("run vanished from ledger: {run_id}");
        };
        if run.status.is_terminal() {
            return Ok(run.status);
        }

        if run.status == RunStatus::Queued && campaign_cancelled(state, campaign_id).await? {
            let outcome = kitt_db::transition_run(
                &state.db,
                run_id,
                RunStatus::Queued,
                RunStatus::Cancelled,
                kitt_db::TransitionFields::default(),
            )
            .await?;
            if outcome == kitt_db::TransitionOutcome::Applied {
                publish_run_status(state, run_id, RunStatus::Cancelled, None).await;
                return Ok(RunStatus::Cancelled);
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return watchdog_fail(state, run_id).await;
        }

        tokio::select! {
            _ = sub.recv() => {}
            _ = tokio::time::sleep_until(std::cmp::min(
                deadline,
                tokio::time::Instant::now() + POLL_INTERVAL,
            )) => {}
        }
    }
}

/// No progress within the per-run budget: force the run to
/// `failed(watchdog)` from whatever non-terminal status it holds.
async fn watchdog_fail(state: &AppState, run_id: &str) -> Result<RunStatus> {
    for from in [RunStatus::Queued, RunStatus::Dispatched, RunStatus::Running] {
        let outcome = kitt_db::transition_run(
            &state.db,
            run_id,
            from,
            RunStatus::Failed,
            kitt_db::TransitionFields {
                error_kind: Some(ErrorKind::Watchdog),
                error: Some("no status within the per-run timeout".to_string()),
                ..Default::default()
            },
        )
        .await?;
        if outcome == kitt_db::TransitionOutcome::Applied {
            publish_run_status(state, run_id, RunStatus::Failed, Some(ErrorKind::Watchdog)).await;
            return Ok(RunStatus::Failed);
        }
    }
    // An agent report slipped in between the deadline and the CAS; take it.
    let run = kitt_db::fetch_run(&state.db, run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run vanished from ledger: {run_id}"))?;
    Ok(run.status)
}

async fn refresh_aggregates(state: &AppState, campaign_id: &str) -> Result<()> {
    let agg = kitt_db::snapshot_campaign(&state.db, campaign_id).await?;
    kitt_db::update_campaign_aggregates(&state.db, campaign_id, &agg).await?;
    Ok(())
}

async fn finalize_campaign(state: &Arc<AppState>, campaign_id: &str) -> Result<()> {
    let agg = kitt_db::snapshot_campaign(&state.db, campaign_id).await?;
    kitt_db::update_campaign_aggregates(&state.db, campaign_id, &agg).await?;

    state
        .publish_log(
            campaign_id,
            format!(
                "Campaign finished: {} succeeded, {} failed, {} skipped, {} cancelled",
                agg.succeeded, agg.failed, agg.skipped, agg.cancelled
            ),
        )
        .await?;

    // A cancel endpoint may already have moved the campaign to `cancelled`;
    // that is terminal and stays. Otherwise the march ran to completion.
    let moved = kitt_db::transition_campaign(
        &state.db,
        campaign_id,
        CampaignStatus::Running,
        CampaignStatus::Completed,
        None,
    )
    .await?;
    if moved {
        publish_campaign_status(state, campaign_id, CampaignStatus::Completed).await;
    } else if let Some(c) = kitt_db::fetch_campaign(&state.db, campaign_id).await? {
        publish_campaign_status(state, campaign_id, c.status).await;
    }

    tracing::info!(
        campaign = campaign_id,
        succeeded = agg.succeeded,
        failed = agg.failed,
        skipped = agg.skipped,
        cancelled = agg.cancelled,
        "campaign finished"
    );
    Ok(())
}

/// Persisted status event on a run stream.
pub async fn publish_run_status(
    state: &AppState,
    run_id: &str,
    status: RunStatus,
    error_kind: Option<ErrorKind>,
) {
    let mut payload = serde_json::json!({ "status": status.as_str() });
    if let Some(kind) = error_kind {
        payload["error_kind"] = serde_json::Value::String(kind.as_str().to_string());
    }
    if let Err(e) = state
        .publish_event(run_id, StreamEventKind::Status, payload)
        .await
    {
        tracing::warn!(run = run_id, "failed to publish run status: {e:#}");
    }
}

/// Persisted status event on a campaign stream.
pub async fn publish_campaign_status(state: &AppState, campaign_id: &str, status: CampaignStatus) {
    if let Err(e) = state
        .publish_event(
            campaign_id,
            StreamEventKind::Status,
            serde_json::json!({ "status": status.as_str() }),
        )
        .await
    {
        tracing::warn!(campaign = campaign_id, "failed to publish campaign status: {e:#}");
    }
}
