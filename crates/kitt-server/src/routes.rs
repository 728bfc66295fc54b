//! Axum router and all HTTP handlers for kitt-server.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use kitt_bus::BusItem;
use kitt_schemas::{
    AgentInfo, CampaignAggregates, CampaignConfig, CampaignSnapshot, CampaignStatus, Command,
    CommandLogLine, CommandStatusUpdate, ErrorKind, HeartbeatRequest, HeartbeatResponse,
    ProvisionRequest, ProvisionResponse, ResultReport, RunInfo, RunStatus, StreamEvent,
    StreamEventKind,
};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::{
    api_types::{
        CampaignCancelResponse, CampaignCreatedResponse, CampaignStartedResponse,
        CampaignSummary, CancelCampaignRequest, CreateCampaignRequest, ErrorResponse,
        HealthResponse, LogAppendedResponse, ResultAcceptedResponse, StatusUpdatedResponse,
        UnregisterResponse,
    },
    auth,
    executor::{publish_campaign_status, publish_run_status},
    registry,
    state::AppState,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/agents/provision", post(provision))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/agents/:name", delete(unregister_agent))
        .route("/api/v1/agents/:name/heartbeat", post(heartbeat))
        .route("/api/v1/agents/:name/results", post(report_result))
        .route("/api/v1/commands/:command_id/log", post(append_command_log))
        .route("/api/v1/commands/:command_id/status", post(update_command_status))
        .route("/api/v1/campaigns", post(create_campaign).get(list_campaigns))
        .route("/api/v1/campaigns/:id", get(get_campaign))
        .route("/api/v1/campaigns/:id/start", post(start_campaign))
        .route("/api/v1/campaigns/:id/cancel", post(cancel_campaign))
        .route("/api/v1/events", get(event_stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn err(status: StatusCode, kind: ErrorKind, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
            kind: kind.as_str().to_string(),
        }),
    )
        .into_response()
}

fn internal(e: anyhow::Error) -> Response {
    tracing::error!("internal error: {e:#}");
    err(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Fatal, "internal error")
}

/// Admin gate for operator endpoints.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if auth::verify_admin_token(state, auth::bearer_token(headers)) {
        Ok(())
    } else {
        state.reject_log.note_rejection("admin endpoint");
        Err(err(StatusCode::UNAUTHORIZED, ErrorKind::Auth, "invalid or missing token"))
    }
}

/// Agent gate: the bearer token must belong to the agent named in the path.
async fn require_agent(
    state: &AppState,
    headers: &HeaderMap,
    name: &str,
) -> Result<kitt_db::AgentRow, Response> {
    let Some(token) = auth::bearer_token(headers) else {
        state.reject_log.note_rejection("agent endpoint, no bearer");
        return Err(err(StatusCode::UNAUTHORIZED, ErrorKind::Auth, "missing bearer token"));
    };
    let agent_id = match auth::verify_agent_token(state, token).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            state.reject_log.note_rejection("agent endpoint, bad token");
            return Err(err(StatusCode::UNAUTHORIZED, ErrorKind::Auth, "invalid token"));
        }
        Err(e) => return Err(internal(e)),
    };

    let agent = match kitt_db::fetch_agent(&state.db, &agent_id).await {
        Ok(Some(a)) => a,
        Ok(None) => {
            return Err(err(StatusCode::UNAUTHORIZED, ErrorKind::Auth, "unknown agent"))
        }
        Err(e) => return Err(internal(e)),
    };
    if agent.name != name {
        return Err(err(
            StatusCode::FORBIDDEN,
            ErrorKind::Auth,
            "token does not belong to this agent",
        ));
    }
    Ok(agent)
}

/// Either a valid admin token or any valid agent token.
async fn require_any(state: &AppState, headers: &HeaderMap) -> Result<auth::Principal, Response> {
    match auth::verify_any(state, headers).await {
        Ok(Some(p)) => Ok(p),
        Ok(None) => {
            state.reject_log.note_rejection("authenticated endpoint");
            Err(err(StatusCode::UNAUTHORIZED, ErrorKind::Auth, "invalid or missing token"))
        }
        Err(e) => Err(internal(e)),
    }
}

fn agent_info(row: &kitt_db::AgentRow, liveness_window: std::time::Duration) -> AgentInfo {
    // status=online iff the last heartbeat is inside the liveness window;
    // computed on read so a lagging sweeper cannot overstate liveness.
    let online = row
        .last_heartbeat
        .map(|hb| {
            Utc::now() - hb
                <= chrono::Duration::from_std(liveness_window)
                    .unwrap_or(chrono::Duration::seconds(15))
        })
        .unwrap_or(false);
    AgentInfo {
        id: row.id.clone(),
        name: row.name.clone(),
        hostname: row.hostname.clone(),
        port: u16::try_from(row.port).unwrap_or(0),
        cpu_arch: row.cpu_arch.clone(),
        gpu_info: row.gpu_info.clone(),
        gpu_count: row.gpu_count,
        ram_gb: row.ram_gb,
        kitt_version: row.kitt_version.clone(),
        status: if online { "online" } else { "offline" }.to_string(),
        token_prefix: row.token_prefix.clone(),
        last_heartbeat: row.last_heartbeat,
        registered_at: row.registered_at,
    }
}

fn run_info(row: &kitt_db::RunRow) -> RunInfo {
    RunInfo {
        id: row.id.clone(),
        campaign_id: row.campaign_id.clone(),
        model_name: row.model_name.clone(),
        model_ref: row.model_ref.clone(),
        engine_name: row.engine_name.clone(),
        benchmark_name: row.benchmark_name.clone(),
        suite_name: row.suite_name.clone(),
        quant: row.quant.clone(),
        estimated_size_gb: row.estimated_size_gb,
        status: row.status,
        command_id: row.command_id.clone(),
        error_kind: row.error_kind,
        error: row.error.clone(),
    }
}

// ---------------------------------------------------------------------------
// GET /api/v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /api/v1/agents/provision
// ---------------------------------------------------------------------------

pub(crate) async fn provision(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ProvisionRequest>,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    if body.name.trim().is_empty() {
        return err(StatusCode::BAD_REQUEST, ErrorKind::Validation, "agent name is required");
    }

    match registry::provision(&st, body.name.trim(), &body.hostname, body.port).await {
        Ok(Some(out)) => (
            StatusCode::CREATED,
            Json(ProvisionResponse {
                agent_id: out.agent_id,
                name: body.name.trim().to_string(),
                token: out.token,
                token_prefix: out.token_prefix,
            }),
        )
            .into_response(),
        Ok(None) => err(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            format!("agent name already registered: {}", body.name.trim()),
        ),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// GET /api/v1/agents
// ---------------------------------------------------------------------------

pub(crate) async fn list_agents(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    match kitt_db::list_agents(&st.db).await {
        Ok(rows) => {
            let agents: Vec<AgentInfo> = rows
                .iter()
                .map(|r| agent_info(r, st.settings.liveness_window))
                .collect();
            (StatusCode::OK, Json(agents)).into_response()
        }
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/agents/:name
// ---------------------------------------------------------------------------

pub(crate) async fn unregister_agent(
    State(st): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    let agent = match kitt_db::fetch_agent_by_name(&st.db, &name).await {
        Ok(Some(a)) => a,
        Ok(None) => return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown agent"),
        Err(e) => return internal(e),
    };
    st.dispatch.clear_agent(&agent.id);
    match kitt_db::delete_agent(&st.db, &agent.id).await {
        Ok(removed) => (StatusCode::OK, Json(UnregisterResponse { removed })).into_response(),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/agents/:name/heartbeat
// ---------------------------------------------------------------------------

/// Liveness + capability update; doubles as the command-fetch channel.
///
/// An agent reporting non-empty `active_commands` is busy: nothing is
/// dequeued (back-pressure). Otherwise the oldest queued command whose run
/// survives the `queued → dispatched` CAS is handed out; commands whose run
/// was cancelled in the meantime are discarded on the spot.
pub(crate) async fn heartbeat(
    State(st): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatRequest>,
) -> Response {
    let agent = match require_agent(&st, &headers, &name).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };

    if let Err(e) =
        kitt_db::update_agent_heartbeat(&st.db, &agent.id, &body.capabilities, Utc::now()).await
    {
        return internal(e);
    }

    let mut command = None;
    if !body.active_commands.is_empty() {
        // Busy agent: benchmark commands are held back as back-pressure,
        // but control commands (stop for the in-flight run) pass through.
        command = st.dispatch.dequeue_control(&agent.id);
    } else {
        command = match pop_next_command(&st, &agent.id).await {
            Ok(c) => c,
            Err(e) => return internal(e),
        };
        if command.is_none() {
            // Nothing queued: check for a dispatch this agent lost (the
            // hand-out response vanished, or the agent restarted) and put
            // it back at the head of the queue.
            if let Err(e) = requeue_unconfirmed(&st, &agent).await {
                return internal(e);
            }
            command = match pop_next_command(&st, &agent.id).await {
                Ok(c) => c,
                Err(e) => return internal(e),
            };
        }
    }

    (
        StatusCode::OK,
        Json(HeartbeatResponse {
            agent_id: agent.id,
            command,
        }),
    )
        .into_response()
}

/// Pop the oldest queued command whose run survives the
/// `queued → dispatched` CAS. Commands whose run was cancelled while queued
/// die here and the next one is tried; control commands with no backing run
/// pass straight through.
async fn pop_next_command(st: &AppState, agent_id: &str) -> anyhow::Result<Option<Command>> {
    loop {
        let Some(cmd) = st.dispatch.dequeue(agent_id) else {
            return Ok(None);
        };
        match kitt_db::fetch_run_by_command(&st.db, &cmd.command_id).await? {
            Some(run) => {
                let outcome = kitt_db::transition_run(
                    &st.db,
                    &run.id,
                    RunStatus::Queued,
                    RunStatus::Dispatched,
                    kitt_db::TransitionFields::default(),
                )
                .await?;
                if outcome == kitt_db::TransitionOutcome::Applied {
                    publish_run_status(st, &run.id, RunStatus::Dispatched, None).await;
                    return Ok(Some(cmd));
                }
            }
            None => return Ok(Some(cmd)),
        }
    }
}

/// Lost-dispatch recovery for an idle agent.
///
/// A run can sit in `dispatched` with no start report when the heartbeat
/// response carrying its command never reached the agent. Once such a run
/// has been unconfirmed for longer than the liveness window, rebuild the
/// command (same command id) and requeue it; the caller's next pop hands it
/// out again. The grace period keeps an immediate heartbeat replay
/// returning `command: null`, and the per-run watchdog remains the
/// backstop for agents that never come back.
async fn requeue_unconfirmed(st: &AppState, agent: &kitt_db::AgentRow) -> anyhow::Result<()> {
    let grace = chrono::Duration::from_std(st.settings.liveness_window)
        .unwrap_or(chrono::Duration::seconds(15));
    let cutoff = Utc::now() - grace;

    for run in kitt_db::list_unconfirmed_dispatched(&st.db, &agent.id, cutoff).await? {
        let Some(campaign) = kitt_db::fetch_campaign(&st.db, &run.campaign_id).await? else {
            continue;
        };
        if campaign.status != CampaignStatus::Running {
            continue;
        }
        let Some(command_id) = run.command_id.clone() else {
            continue;
        };

        let command =
            crate::executor::build_run_command(&campaign.config_json, &run, &agent.id, command_id);
        if st.dispatch.requeue(&st.db, command).await? {
            tracing::info!(run = %run.id, agent = %agent.name, "requeued unconfirmed dispatch");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// POST /api/v1/agents/:name/results
// ---------------------------------------------------------------------------

/// Terminal report for a command. Exactly one acceptance advances the
/// ledger; replays are acknowledged but change nothing.
pub(crate) async fn report_result(
    State(st): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(report): Json<ResultReport>,
) -> Response {
    let agent = match require_agent(&st, &headers, &name).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };

    if !matches!(report.status, RunStatus::Completed | RunStatus::Failed) {
        return err(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "result status must be completed or failed",
        );
    }

    let run = match kitt_db::fetch_run_by_command(&st.db, &report.command_id).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown command_id")
        }
        Err(e) => return internal(e),
    };
    if let Err(resp) = ensure_run_belongs_to_agent(&st, &run, &agent).await {
        return resp;
    }

    // Compatibility and resource refusals are skips, not failures.
    let target = match report.error_kind {
        Some(ErrorKind::Incompatible) | Some(ErrorKind::ResourceExceeded) => RunStatus::Skipped,
        _ => report.status,
    };
    let kind = match (target, report.error_kind) {
        (_, Some(k)) => Some(k),
        (RunStatus::Failed, None) => Some(ErrorKind::EngineError),
        _ => None,
    };

    let fields = kitt_db::TransitionFields {
        command_id: None,
        error_kind: kind,
        error: report.error.clone(),
    };
    let mut applied = false;
    for from in [RunStatus::Running, RunStatus::Dispatched, RunStatus::Queued] {
        match kitt_db::transition_run(&st.db, &run.id, from, target, fields.clone()).await {
            Ok(kitt_db::TransitionOutcome::Applied) => {
                applied = true;
                break;
            }
            Ok(kitt_db::TransitionOutcome::Conflict) => {}
            Err(e) => return internal(e),
        }
    }

    if !applied {
        // Duplicate (run already terminal) or racing transition.
        let current = match kitt_db::fetch_run(&st.db, &run.id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "run vanished")
            }
            Err(e) => return internal(e),
        };
        if current.status.is_terminal() {
            return (
                StatusCode::OK,
                Json(ResultAcceptedResponse {
                    accepted: true,
                    duplicate: true,
                }),
            )
                .into_response();
        }
        return err(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            "run is not in a dispatchable state",
        );
    }

    let result = kitt_db::NewResult {
        run_id: run.id.clone(),
        command_id: report.command_id.clone(),
        passed: target == RunStatus::Completed,
        metrics_json: report.metrics.clone(),
        output_location: report.output_location.clone().unwrap_or_default(),
        hardware_json: report.hardware.clone(),
    };
    if let Err(e) = kitt_db::insert_result(&st.db, &result).await {
        return internal(e);
    }

    publish_run_status(&st, &run.id, target, kind).await;

    (
        StatusCode::OK,
        Json(ResultAcceptedResponse {
            accepted: true,
            duplicate: false,
        }),
    )
        .into_response()
}

/// The reporting agent must be the campaign's target agent.
async fn ensure_run_belongs_to_agent(
    st: &AppState,
    run: &kitt_db::RunRow,
    agent: &kitt_db::AgentRow,
) -> Result<(), Response> {
    match kitt_db::fetch_campaign(&st.db, &run.campaign_id).await {
        Ok(Some(c)) if c.agent_id.as_deref() == Some(agent.id.as_str()) => Ok(()),
        Ok(_) => Err(err(
            StatusCode::FORBIDDEN,
            ErrorKind::Auth,
            "command belongs to another agent",
        )),
        Err(e) => Err(internal(e)),
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/commands/:command_id/log
// ---------------------------------------------------------------------------

pub(crate) async fn append_command_log(
    State(st): State<Arc<AppState>>,
    Path(command_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CommandLogLine>,
) -> Response {
    if let Err(resp) = require_any(&st, &headers).await {
        return resp;
    }
    let run = match kitt_db::fetch_run_by_command(&st.db, &command_id).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown command_id")
        }
        Err(e) => return internal(e),
    };

    match st
        .publish_event(
            &run.id,
            StreamEventKind::Log,
            serde_json::json!({ "line": body.line }),
        )
        .await
    {
        Ok(sequence) => {
            (StatusCode::OK, Json(LogAppendedResponse { sequence })).into_response()
        }
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/commands/:command_id/status
// ---------------------------------------------------------------------------

/// Agent callback moving a run `dispatched → running`.
pub(crate) async fn update_command_status(
    State(st): State<Arc<AppState>>,
    Path(command_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CommandStatusUpdate>,
) -> Response {
    if let Err(resp) = require_any(&st, &headers).await {
        return resp;
    }
    if body.status != RunStatus::Running {
        return err(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "only 'running' can be reported here; terminal statuses go to the results endpoint",
        );
    }

    let run = match kitt_db::fetch_run_by_command(&st.db, &command_id).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown command_id")
        }
        Err(e) => return internal(e),
    };

    match kitt_db::transition_run(
        &st.db,
        &run.id,
        RunStatus::Dispatched,
        RunStatus::Running,
        kitt_db::TransitionFields::default(),
    )
    .await
    {
        Ok(kitt_db::TransitionOutcome::Applied) => {
            publish_run_status(&st, &run.id, RunStatus::Running, None).await;
            (StatusCode::OK, Json(StatusUpdatedResponse { updated: true })).into_response()
        }
        Ok(kitt_db::TransitionOutcome::Conflict) => {
            (StatusCode::OK, Json(StatusUpdatedResponse { updated: false })).into_response()
        }
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/campaigns  +  GET /api/v1/campaigns
// ---------------------------------------------------------------------------

pub(crate) async fn create_campaign(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateCampaignRequest>,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    if body.config.name.trim().is_empty() {
        return err(StatusCode::BAD_REQUEST, ErrorKind::Validation, "campaign name is required");
    }

    let agent = match (&body.agent_id, &body.agent_name) {
        (Some(id), _) => kitt_db::fetch_agent(&st.db, id).await,
        (None, Some(name)) => kitt_db::fetch_agent_by_name(&st.db, name).await,
        (None, None) => {
            return err(
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation,
                "agent_id or agent_name is required",
            )
        }
    };
    let agent = match agent {
        Ok(Some(a)) => a,
        Ok(None) => return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown agent"),
        Err(e) => return internal(e),
    };

    let config_json = match serde_json::to_value(&body.config) {
        Ok(v) => v,
        Err(e) => return internal(e.into()),
    };
    let loaded = kitt_config::LoadedConfig::from_value(config_json);

    let campaign = kitt_db::NewCampaign {
        id: Uuid::new_v4().to_string(),
        name: body.config.name.trim().to_string(),
        config_json: loaded.config_json,
        config_hash: loaded.config_hash,
        agent_id: Some(agent.id),
        created_at: Utc::now(),
    };
    if let Err(e) = kitt_db::create_campaign(&st.db, &campaign).await {
        return internal(e);
    }

    (
        StatusCode::CREATED,
        Json(CampaignCreatedResponse {
            id: campaign.id,
            status: CampaignStatus::Draft.as_str().to_string(),
        }),
    )
        .into_response()
}

pub(crate) async fn list_campaigns(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    match kitt_db::list_campaigns(&st.db).await {
        Ok(rows) => {
            let summaries: Vec<CampaignSummary> = rows
                .into_iter()
                .map(|c| CampaignSummary {
                    id: c.id,
                    name: c.name,
                    status: c.status.as_str().to_string(),
                    agent_id: c.agent_id,
                    total_runs: c.total_runs,
                    succeeded: c.succeeded,
                    failed: c.failed,
                    skipped: c.skipped,
                    cancelled: c.cancelled,
                    created_at: c.created_at,
                })
                .collect();
            (StatusCode::OK, Json(summaries)).into_response()
        }
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/campaigns/:id/start
// ---------------------------------------------------------------------------

/// Move a draft campaign to `queued`: expand the plan into the ledger,
/// then hand the march to a freshly spawned executor.
pub(crate) async fn start_campaign(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    let campaign = match kitt_db::fetch_campaign(&st.db, &id).await {
        Ok(Some(c)) => c,
        Ok(None) => return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown campaign"),
        Err(e) => return internal(e),
    };

    let config: CampaignConfig = match serde_json::from_value(campaign.config_json.clone()) {
        Ok(c) => c,
        Err(e) => {
            return err(
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation,
                format!("campaign config does not parse: {e}"),
            )
        }
    };

    let moved = match kitt_db::transition_campaign(
        &st.db,
        &id,
        CampaignStatus::Draft,
        CampaignStatus::Queued,
        None,
    )
    .await
    {
        Ok(m) => m,
        Err(e) => return internal(e),
    };
    if !moved {
        return err(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            format!("campaign is not in draft (currently {})", campaign.status.as_str()),
        );
    }

    // Plan. A catalog outage fails the campaign rather than leaving it
    // wedged in `queued`.
    let outcome = match kitt_planner::plan_campaign(&config, st.catalog.as_ref()).await {
        Ok(o) => o,
        Err(e) => {
            let _ = kitt_db::transition_campaign(
                &st.db,
                &id,
                CampaignStatus::Queued,
                CampaignStatus::Failed,
                Some(&format!("planning failed: {e:#}")),
            )
            .await;
            return err(
                StatusCode::BAD_GATEWAY,
                ErrorKind::TransientRemote,
                format!("planning failed: {e:#}"),
            );
        }
    };

    let new_runs: Vec<kitt_db::NewPlannedRun> = outcome
        .runs
        .iter()
        .enumerate()
        .map(|(i, r)| kitt_db::NewPlannedRun {
            id: Uuid::new_v4().to_string(),
            plan_order: i as i64,
            model_name: r.model_name.clone(),
            model_ref: r.model_ref.clone(),
            engine_name: r.engine_name.clone(),
            engine_mode: r.engine_mode,
            benchmark_name: r.benchmark_name.clone(),
            suite_name: r.suite_name.clone(),
            quant: r.quant.clone(),
            include_pattern: r.include_pattern.clone(),
            estimated_size_gb: r.estimated_size_gb,
            status: if r.skip.is_some() {
                RunStatus::Skipped
            } else {
                RunStatus::Pending
            },
            error_kind: r.skip.as_ref().map(|(k, _)| *k),
            error: r.skip.as_ref().map(|(_, msg)| msg.clone()),
        })
        .collect();

    if let Err(e) = kitt_db::insert_planned_runs(&st.db, &id, &new_runs).await {
        return internal(e);
    }

    let mut plan_skips = Vec::with_capacity(outcome.skips.len());
    for skip in &outcome.skips {
        let line = format!(
            "Plan: skipping {} on {}: {}",
            skip.model_name, skip.engine_name, skip.reason
        );
        let _ = st.publish_log(&id, line.clone()).await;
        plan_skips.push(line);
    }

    let agg = match kitt_db::snapshot_campaign(&st.db, &id).await {
        Ok(a) => a,
        Err(e) => return internal(e),
    };
    if let Err(e) = kitt_db::update_campaign_aggregates(&st.db, &id, &agg).await {
        return internal(e);
    }
    publish_campaign_status(&st, &id, CampaignStatus::Queued).await;

    st.executors.spawn(Arc::clone(&st), &id);

    (
        StatusCode::OK,
        Json(CampaignStartedResponse {
            id,
            status: CampaignStatus::Queued.as_str().to_string(),
            total_runs: agg.total_runs,
            plan_skips,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /api/v1/campaigns/:id/cancel
// ---------------------------------------------------------------------------

/// Request cancellation. The executor drains the current run (or hits the
/// watchdog) and marks the rest cancelled. The in-flight command on the
/// agent is not pre-empted unless the caller asks for `stop_current`, which
/// enqueues a `stop_container` command referencing it.
pub(crate) async fn cancel_campaign(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CancelCampaignRequest>>,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    let stop_current = body.map(|Json(b)| b.stop_current).unwrap_or(false);

    for from in [CampaignStatus::Running, CampaignStatus::Queued, CampaignStatus::Draft] {
        match kitt_db::transition_campaign(&st.db, &id, from, CampaignStatus::Cancelled, None)
            .await
        {
            Ok(true) => {
                publish_campaign_status(&st, &id, CampaignStatus::Cancelled).await;
                let _ = st.publish_log(&id, "Campaign cancelled by user").await;

                let stop_command = if stop_current {
                    match enqueue_stop_for_in_flight(&st, &id).await {
                        Ok(cmd) => cmd,
                        Err(e) => return internal(e),
                    }
                } else {
                    None
                };

                return (
                    StatusCode::OK,
                    Json(CampaignCancelResponse {
                        id,
                        status: CampaignStatus::Cancelled.as_str().to_string(),
                        stop_command,
                    }),
                )
                    .into_response();
            }
            Ok(false) => {}
            Err(e) => return internal(e),
        }
    }

    match kitt_db::fetch_campaign(&st.db, &id).await {
        Ok(Some(c)) => err(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            format!("campaign already {}", c.status.as_str()),
        ),
        Ok(None) => err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown campaign"),
        Err(e) => internal(e),
    }
}

/// Build and enqueue a `stop_container` command for the campaign's in-flight
/// run, if there is one. Returns the stop command's id.
async fn enqueue_stop_for_in_flight(
    st: &AppState,
    campaign_id: &str,
) -> anyhow::Result<Option<String>> {
    let Some(campaign) = kitt_db::fetch_campaign(&st.db, campaign_id).await? else {
        return Ok(None);
    };
    let Some(agent_id) = campaign.agent_id else {
        return Ok(None);
    };

    let in_flight = kitt_db::list_runs_in_flight(&st.db, campaign_id).await?;
    let Some(target) = in_flight.iter().find_map(|r| r.command_id.clone()) else {
        return Ok(None);
    };

    let stop = kitt_schemas::Command {
        command_id: Uuid::new_v4().to_string(),
        agent_id,
        command_type: kitt_schemas::CommandType::StopContainer,
        payload: kitt_schemas::CommandPayload {
            target_command_id: Some(target),
            ..Default::default()
        },
        created_at: Utc::now(),
    };
    let stop_id = stop.command_id.clone();
    match st.dispatch.enqueue(stop) {
        Ok(()) => Ok(Some(stop_id)),
        Err(full) => {
            tracing::warn!("could not enqueue stop command: {full}");
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// GET /api/v1/campaigns/:id
// ---------------------------------------------------------------------------

pub(crate) async fn get_campaign(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_any(&st, &headers).await {
        return resp;
    }
    let campaign = match kitt_db::fetch_campaign(&st.db, &id).await {
        Ok(Some(c)) => c,
        Ok(None) => return err(StatusCode::NOT_FOUND, ErrorKind::NotFound, "unknown campaign"),
        Err(e) => return internal(e),
    };
    let aggregates: CampaignAggregates = match kitt_db::snapshot_campaign(&st.db, &id).await {
        Ok(a) => a,
        Err(e) => return internal(e),
    };
    let runs = match kitt_db::list_runs(&st.db, &id).await {
        Ok(r) => r,
        Err(e) => return internal(e),
    };

    (
        StatusCode::OK,
        Json(CampaignSnapshot {
            id: campaign.id,
            name: campaign.name,
            status: campaign.status,
            agent_id: campaign.agent_id,
            aggregates,
            created_at: campaign.created_at,
            started_at: campaign.started_at,
            completed_at: campaign.completed_at,
            runs: runs.iter().map(run_info).collect(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /api/v1/events?stream=<id>  (SSE)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct EventStreamQuery {
    stream: String,
}

/// Server-sent events for one stream (campaign id or run id).
///
/// `id:` carries the per-stream sequence; a client reconnecting with
/// `Last-Event-ID` gets the persisted backlog replayed before going live.
/// A subscriber that cannot keep up receives `dropped` markers instead of
/// slowing anyone else down.
pub(crate) async fn event_stream(
    State(st): State<Arc<AppState>>,
    Query(query): Query<EventStreamQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_any(&st, &headers).await {
        return resp;
    }

    let last_seen: i64 = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // Subscribe before reading the backlog so no event falls in the gap;
    // the forwarder deduplicates the overlap by sequence.
    let mut sub = st.bus.subscribe(&query.stream);
    let backlog = match kitt_db::list_events_after(&st.db, &query.stream, last_seen, 10_000).await
    {
        Ok(events) => events,
        Err(e) => return internal(e),
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(async move {
        let mut last_seq = last_seen;
        for ev in backlog {
            last_seq = ev.sequence;
            if tx.send(Ok(sse_event(&ev))).await.is_err() {
                return;
            }
        }
        loop {
            match sub.recv().await {
                Some(BusItem::Event(ev)) => {
                    if ev.sequence <= last_seq {
                        continue;
                    }
                    last_seq = ev.sequence;
                    if tx.send(Ok(sse_event(&ev))).await.is_err() {
                        return;
                    }
                }
                Some(BusItem::Dropped(n)) => {
                    let marker = Event::default()
                        .event("dropped")
                        .data(format!("{{\"dropped\":{n}}}"));
                    if tx.send(Ok(marker)).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    });

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    resp_headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    (
        resp_headers,
        Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new()),
    )
        .into_response()
}

fn sse_event(ev: &StreamEvent) -> Event {
    let data = serde_json::to_string(&ev.payload).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .event(ev.kind.as_str())
        .id(ev.sequence.to_string())
        .data(data)
}
