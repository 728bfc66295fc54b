//! Run ledger: durable, crash-safe persistence for the orchestration core.
//!
//! Single-file SQLite database in WAL mode. All writes are transactional;
//! every run status transition is one compare-and-set UPDATE, so transitions
//! are linearizable per run. Aggregates are always derivable from run rows.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use kitt_schemas::{
    AgentCapabilities, CampaignAggregates, CampaignStatus, EngineMode, ErrorKind, RunStatus,
    StreamEvent, StreamEventKind,
};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

pub mod migrations;

pub use migrations::{current_version, migrate, SCHEMA_VERSION};

pub const ENV_DB_PATH: &str = "KITT_DB_PATH";

/// Open (creating if missing) the ledger at `path` and apply migrations.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to open ledger at {path}"))?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Connect using KITT_DB_PATH (defaults to ./kitt.db).
pub async fn connect_from_env() -> Result<SqlitePool> {
    let path = std::env::var(ENV_DB_PATH).unwrap_or_else(|_| "kitt.db".to_string());
    connect(&path).await
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &SqlitePool) -> Result<DbStatus> {
    let (one,): (i64,) = sqlx::query_as("SELECT 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (i64,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'planned_runs')",
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_runs_table: exists == 1,
        schema_version: current_version(pool).await?,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_runs_table: bool,
    pub schema_version: i64,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: i64,
    pub cpu_arch: String,
    pub gpu_info: String,
    pub gpu_count: i64,
    pub ram_gb: i64,
    pub kitt_version: String,
    pub hardware_json: Value,
    pub status: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub token_hash: String,
    pub token_prefix: String,
    pub registered_at: DateTime<Utc>,
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentRow> {
    Ok(AgentRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        hostname: row.try_get("hostname")?,
        port: row.try_get("port")?,
        cpu_arch: row.try_get("cpu_arch")?,
        gpu_info: row.try_get("gpu_info")?,
        gpu_count: row.try_get("gpu_count")?,
        ram_gb: row.try_get("ram_gb")?,
        kitt_version: row.try_get("kitt_version")?,
        hardware_json: row.try_get("hardware_json")?,
        status: row.try_get("status")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        token_hash: row.try_get("token_hash")?,
        token_prefix: row.try_get("token_prefix")?,
        registered_at: row.try_get("registered_at")?,
    })
}

const AGENT_COLUMNS: &str = "id, name, hostname, port, cpu_arch, gpu_info, gpu_count, ram_gb, \
     kitt_version, hardware_json, status, last_heartbeat, token_hash, token_prefix, registered_at";

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: i64,
    pub token_hash: String,
    pub token_prefix: String,
    pub registered_at: DateTime<Utc>,
}

/// Insert an agent record. Returns `false` (and changes nothing) when the
/// name is already taken.
pub async fn insert_agent(pool: &SqlitePool, agent: &NewAgent) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        INSERT INTO agents (id, name, hostname, port, token_hash, token_prefix, registered_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(name) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&agent.id)
    .bind(&agent.name)
    .bind(&agent.hostname)
    .bind(agent.port)
    .bind(&agent.token_hash)
    .bind(&agent.token_prefix)
    .bind(agent.registered_at)
    .fetch_optional(pool)
    .await
    .context("insert_agent failed")?;

    Ok(row.is_some())
}

pub async fn fetch_agent(pool: &SqlitePool, agent_id: &str) -> Result<Option<AgentRow>> {
    let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"))
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .context("fetch_agent failed")?;
    row.as_ref().map(agent_from_row).transpose()
}

pub async fn fetch_agent_by_name(pool: &SqlitePool, name: &str) -> Result<Option<AgentRow>> {
    let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1"))
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("fetch_agent_by_name failed")?;
    row.as_ref().map(agent_from_row).transpose()
}

pub async fn list_agents(pool: &SqlitePool) -> Result<Vec<AgentRow>> {
    let rows = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY name"))
        .fetch_all(pool)
        .await
        .context("list_agents failed")?;
    rows.iter().map(agent_from_row).collect()
}

/// (agent_id, token_hash) pairs for token verification. The caller compares
/// against every row in constant time.
pub async fn list_agent_auth(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, token_hash FROM agents")
        .fetch_all(pool)
        .await
        .context("list_agent_auth failed")?;
    Ok(rows)
}

/// Atomic liveness + capability update on heartbeat.
pub async fn update_agent_heartbeat(
    pool: &SqlitePool,
    agent_id: &str,
    caps: &AgentCapabilities,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE agents
           SET status = 'online',
               last_heartbeat = ?2,
               hostname = CASE WHEN ?3 != '' THEN ?3 ELSE hostname END,
               cpu_arch = ?4,
               gpu_info = ?5,
               gpu_count = ?6,
               ram_gb = ?7,
               kitt_version = ?8,
               hardware_json = ?9
         WHERE id = ?1
        "#,
    )
    .bind(agent_id)
    .bind(now)
    .bind(&caps.hostname)
    .bind(&caps.cpu_arch)
    .bind(&caps.gpu_info)
    .bind(caps.gpu_count)
    .bind(caps.ram_gb)
    .bind(&caps.kitt_version)
    .bind(&caps.hardware)
    .execute(pool)
    .await
    .context("update_agent_heartbeat failed")?;
    Ok(())
}

/// Demote agents whose last heartbeat is older than `cutoff`. Returns the
/// number of agents demoted.
pub async fn mark_stale_agents_offline(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        r#"
        UPDATE agents
           SET status = 'offline'
         WHERE status = 'online'
           AND (last_heartbeat IS NULL OR last_heartbeat < ?1)
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("mark_stale_agents_offline failed")?;
    Ok(res.rows_affected())
}

pub async fn delete_agent(pool: &SqlitePool, agent_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM agents WHERE id = ?1")
        .bind(agent_id)
        .execute(pool)
        .await
        .context("delete_agent failed")?;
    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CampaignRow {
    pub id: String,
    pub name: String,
    pub config_json: Value,
    pub config_hash: String,
    pub status: CampaignStatus,
    pub agent_id: Option<String>,
    pub total_runs: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub cancelled: i64,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

const CAMPAIGN_COLUMNS: &str = "id, name, config_json, config_hash, status, agent_id, total_runs, \
     succeeded, failed, skipped, cancelled, error, created_at, started_at, completed_at";

fn campaign_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CampaignRow> {
    let status_raw: String = row.try_get("status")?;
    Ok(CampaignRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        config_json: row.try_get("config_json")?,
        config_hash: row.try_get("config_hash")?,
        status: CampaignStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("invalid campaign status: {status_raw}"))?,
        agent_id: row.try_get("agent_id")?,
        total_runs: row.try_get("total_runs")?,
        succeeded: row.try_get("succeeded")?,
        failed: row.try_get("failed")?,
        skipped: row.try_get("skipped")?,
        cancelled: row.try_get("cancelled")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub id: String,
    pub name: String,
    pub config_json: Value,
    pub config_hash: String,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Create a campaign in `draft`.
pub async fn create_campaign(pool: &SqlitePool, campaign: &NewCampaign) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO campaigns (id, name, config_json, config_hash, status, agent_id, created_at)
        VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6)
        "#,
    )
    .bind(&campaign.id)
    .bind(&campaign.name)
    .bind(&campaign.config_json)
    .bind(&campaign.config_hash)
    .bind(&campaign.agent_id)
    .bind(campaign.created_at)
    .execute(pool)
    .await
    .context("create_campaign failed")?;
    Ok(())
}

pub async fn fetch_campaign(pool: &SqlitePool, campaign_id: &str) -> Result<Option<CampaignRow>> {
    let row = sqlx::query(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"
    ))
    .bind(campaign_id)
    .fetch_optional(pool)
    .await
    .context("fetch_campaign failed")?;
    row.as_ref().map(campaign_from_row).transpose()
}

pub async fn list_campaigns(pool: &SqlitePool) -> Result<Vec<CampaignRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await
    .context("list_campaigns failed")?;
    rows.iter().map(campaign_from_row).collect()
}

/// Campaigns to re-hydrate executors for at startup.
pub async fn load_open_campaigns(pool: &SqlitePool) -> Result<Vec<CampaignRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status IN ('queued', 'running') ORDER BY created_at"
    ))
    .fetch_all(pool)
    .await
    .context("load_open_campaigns failed")?;
    rows.iter().map(campaign_from_row).collect()
}

/// Compare-and-set campaign status. Returns `false` when the current status
/// did not match `from` (another writer won the race).
pub async fn transition_campaign(
    pool: &SqlitePool,
    campaign_id: &str,
    from: CampaignStatus,
    to: CampaignStatus,
    error: Option<&str>,
) -> Result<bool> {
    let now = Utc::now();
    let res = sqlx::query(
        r#"
        UPDATE campaigns
           SET status = ?2,
               error = COALESCE(?4, error),
               started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?5 ELSE started_at END,
               completed_at = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled') THEN ?5 ELSE completed_at END
         WHERE id = ?1 AND status = ?3
        "#,
    )
    .bind(campaign_id)
    .bind(to.as_str())
    .bind(from.as_str())
    .bind(error)
    .bind(now)
    .execute(pool)
    .await
    .context("transition_campaign failed")?;

    Ok(res.rows_affected() > 0)
}

/// Refresh the denormalized aggregate counters from run rows.
pub async fn update_campaign_aggregates(
    pool: &SqlitePool,
    campaign_id: &str,
    agg: &CampaignAggregates,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaigns
           SET total_runs = ?2, succeeded = ?3, failed = ?4, skipped = ?5, cancelled = ?6
         WHERE id = ?1
        "#,
    )
    .bind(campaign_id)
    .bind(agg.total_runs)
    .bind(agg.succeeded)
    .bind(agg.failed)
    .bind(agg.skipped)
    .bind(agg.cancelled)
    .execute(pool)
    .await
    .context("update_campaign_aggregates failed")?;
    Ok(())
}

/// Aggregate counts derived from run rows (never from the denormalized
/// columns).
pub async fn snapshot_campaign(
    pool: &SqlitePool,
    campaign_id: &str,
) -> Result<CampaignAggregates> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM planned_runs WHERE campaign_id = ?1 GROUP BY status",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await
    .context("snapshot_campaign failed")?;

    let mut agg = CampaignAggregates {
        total_runs: 0,
        succeeded: 0,
        failed: 0,
        skipped: 0,
        cancelled: 0,
        pending_or_running: 0,
    };
    for (status_raw, count) in rows {
        let status = RunStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("invalid run status in ledger: {status_raw}"))?;
        agg.total_runs += count;
        match status {
            RunStatus::Completed => agg.succeeded += count,
            RunStatus::Failed => agg.failed += count,
            RunStatus::Skipped => agg.skipped += count,
            RunStatus::Cancelled => agg.cancelled += count,
            RunStatus::Pending | RunStatus::Queued | RunStatus::Dispatched | RunStatus::Running => {
                agg.pending_or_running += count
            }
        }
    }
    Ok(agg)
}

// ---------------------------------------------------------------------------
// Planned runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub campaign_id: String,
    pub plan_order: i64,
    pub model_name: String,
    pub model_ref: String,
    pub engine_name: String,
    pub engine_mode: EngineMode,
    pub benchmark_name: String,
    pub suite_name: String,
    pub quant: String,
    pub include_pattern: Option<String>,
    pub estimated_size_gb: f64,
    pub status: RunStatus,
    pub command_id: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
}

const RUN_COLUMNS: &str = "id, campaign_id, plan_order, model_name, model_ref, engine_name, \
     engine_mode, benchmark_name, suite_name, quant, include_pattern, estimated_size_gb, status, \
     command_id, error_kind, error, created_at, queued_at, dispatched_at, started_at, \
     completed_at, last_transition_at";

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunRow> {
    let status_raw: String = row.try_get("status")?;
    let mode_raw: String = row.try_get("engine_mode")?;
    let kind_raw: Option<String> = row.try_get("error_kind")?;
    Ok(RunRow {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        plan_order: row.try_get("plan_order")?,
        model_name: row.try_get("model_name")?,
        model_ref: row.try_get("model_ref")?,
        engine_name: row.try_get("engine_name")?,
        engine_mode: EngineMode::parse(&mode_raw)
            .ok_or_else(|| anyhow!("invalid engine mode: {mode_raw}"))?,
        benchmark_name: row.try_get("benchmark_name")?,
        suite_name: row.try_get("suite_name")?,
        quant: row.try_get("quant")?,
        include_pattern: row.try_get("include_pattern")?,
        estimated_size_gb: row.try_get("estimated_size_gb")?,
        status: RunStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("invalid run status: {status_raw}"))?,
        command_id: row.try_get("command_id")?,
        error_kind: kind_raw.as_deref().and_then(ErrorKind::parse),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        queued_at: row.try_get("queued_at")?,
        dispatched_at: row.try_get("dispatched_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_transition_at: row.try_get("last_transition_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct NewPlannedRun {
    pub id: String,
    pub plan_order: i64,
    pub model_name: String,
    pub model_ref: String,
    pub engine_name: String,
    pub engine_mode: EngineMode,
    pub benchmark_name: String,
    pub suite_name: String,
    pub quant: String,
    pub include_pattern: Option<String>,
    pub estimated_size_gb: f64,
    /// `pending`, or `skipped` for plan-time skips (with kind + error set).
    pub status: RunStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

/// Insert planned runs, idempotent on the uniqueness key
/// (campaign_id, model_ref, engine_name, quant, benchmark_name).
/// Returns the number of rows actually inserted.
pub async fn insert_planned_runs(
    pool: &SqlitePool,
    campaign_id: &str,
    runs: &[NewPlannedRun],
) -> Result<u64> {
    let now = Utc::now();
    let mut inserted = 0;
    let mut tx = pool.begin().await.context("insert_planned_runs begin failed")?;

    for run in runs {
        let res = sqlx::query(
            r#"
            INSERT INTO planned_runs (
                id, campaign_id, plan_order, model_name, model_ref, engine_name, engine_mode,
                benchmark_name, suite_name, quant, include_pattern, estimated_size_gb, status,
                error_kind, error, created_at, completed_at, last_transition_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                CASE WHEN ?13 = 'skipped' THEN ?16 ELSE NULL END, ?16
            )
            ON CONFLICT(campaign_id, model_ref, engine_name, quant, benchmark_name) DO NOTHING
            "#,
        )
        .bind(&run.id)
        .bind(campaign_id)
        .bind(run.plan_order)
        .bind(&run.model_name)
        .bind(&run.model_ref)
        .bind(&run.engine_name)
        .bind(run.engine_mode.as_str())
        .bind(&run.benchmark_name)
        .bind(&run.suite_name)
        .bind(&run.quant)
        .bind(&run.include_pattern)
        .bind(run.estimated_size_gb)
        .bind(run.status.as_str())
        .bind(run.error_kind.map(|k| k.as_str()))
        .bind(&run.error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("insert_planned_runs insert failed")?;
        inserted += res.rows_affected();
    }

    tx.commit().await.context("insert_planned_runs commit failed")?;
    Ok(inserted)
}

pub async fn fetch_run(pool: &SqlitePool, run_id: &str) -> Result<Option<RunRow>> {
    let row = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM planned_runs WHERE id = ?1"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("fetch_run failed")?;
    row.as_ref().map(run_from_row).transpose()
}

pub async fn fetch_run_by_command(pool: &SqlitePool, command_id: &str) -> Result<Option<RunRow>> {
    let row = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM planned_runs WHERE command_id = ?1"
    ))
    .bind(command_id)
    .fetch_optional(pool)
    .await
    .context("fetch_run_by_command failed")?;
    row.as_ref().map(run_from_row).transpose()
}

/// All runs of a campaign in plan order.
pub async fn list_runs(pool: &SqlitePool, campaign_id: &str) -> Result<Vec<RunRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM planned_runs WHERE campaign_id = ?1 ORDER BY plan_order"
    ))
    .bind(campaign_id)
    .fetch_all(pool)
    .await
    .context("list_runs failed")?;
    rows.iter().map(run_from_row).collect()
}

/// Runs handed to an agent but not yet settled (`dispatched` or `running`).
pub async fn list_runs_in_flight(pool: &SqlitePool, campaign_id: &str) -> Result<Vec<RunRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM planned_runs WHERE campaign_id = ?1 AND status IN ('dispatched', 'running') ORDER BY plan_order"
    ))
    .bind(campaign_id)
    .fetch_all(pool)
    .await
    .context("list_runs_in_flight failed")?;
    rows.iter().map(run_from_row).collect()
}

/// Runs dispatched to an agent whose start was never reported, with the
/// hand-out older than `dispatched_before`. These are lost commands (the
/// heartbeat response vanished, or the agent restarted): the dispatcher
/// feeds them back into the agent's queue.
pub async fn list_unconfirmed_dispatched(
    pool: &SqlitePool,
    agent_id: &str,
    dispatched_before: DateTime<Utc>,
) -> Result<Vec<RunRow>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {RUN_COLUMNS} FROM planned_runs
         WHERE status = 'dispatched'
           AND started_at IS NULL
           AND dispatched_at < ?2
           AND campaign_id IN (SELECT id FROM campaigns WHERE agent_id = ?1)
         ORDER BY plan_order
        "#
    ))
    .bind(agent_id)
    .bind(dispatched_before)
    .fetch_all(pool)
    .await
    .context("list_unconfirmed_dispatched failed")?;
    rows.iter().map(run_from_row).collect()
}

/// Extra fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub command_id: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

/// Outcome of a compare-and-set transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The run was not in `from` (lost a race, or `from` was terminal).
    Conflict,
}

/// Compare-and-set run transition. Rejects terminal `from` states before
/// touching the database; otherwise one UPDATE guarded on the current
/// status. Records the per-status timestamp and the last-transition time
/// (the watchdog's reference point).
pub async fn transition_run(
    pool: &SqlitePool,
    run_id: &str,
    from: RunStatus,
    to: RunStatus,
    fields: TransitionFields,
) -> Result<TransitionOutcome> {
    if from.is_terminal() {
        return Ok(TransitionOutcome::Conflict);
    }

    let now = Utc::now();
    let res = sqlx::query(
        r#"
        UPDATE planned_runs
           SET status = ?2,
               command_id = COALESCE(?4, command_id),
               error_kind = COALESCE(?5, error_kind),
               error = COALESCE(?6, error),
               queued_at = CASE WHEN ?2 = 'queued' THEN ?7 ELSE queued_at END,
               dispatched_at = CASE WHEN ?2 = 'dispatched' THEN ?7 ELSE dispatched_at END,
               started_at = CASE WHEN ?2 = 'running' THEN ?7 ELSE started_at END,
               completed_at = CASE WHEN ?2 IN ('completed', 'failed', 'skipped', 'cancelled') THEN ?7 ELSE completed_at END,
               last_transition_at = ?7
         WHERE id = ?1 AND status = ?3
        "#,
    )
    .bind(run_id)
    .bind(to.as_str())
    .bind(from.as_str())
    .bind(&fields.command_id)
    .bind(fields.error_kind.map(|k| k.as_str()))
    .bind(&fields.error)
    .bind(now)
    .execute(pool)
    .await
    .context("transition_run failed")?;

    if res.rows_affected() > 0 {
        Ok(TransitionOutcome::Applied)
    } else {
        Ok(TransitionOutcome::Conflict)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewResult {
    pub run_id: String,
    pub command_id: String,
    pub passed: bool,
    pub metrics_json: Value,
    pub output_location: String,
    pub hardware_json: Value,
}

/// Write-once result row. Returns `false` when a result already exists
/// (a duplicate report, absorbed as a no-op).
pub async fn insert_result(pool: &SqlitePool, result: &NewResult) -> Result<bool> {
    let res = sqlx::query(
        r#"
        INSERT INTO run_results (run_id, command_id, passed, metrics_json, output_location, hardware_json, reported_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(run_id) DO NOTHING
        "#,
    )
    .bind(&result.run_id)
    .bind(&result.command_id)
    .bind(result.passed)
    .bind(&result.metrics_json)
    .bind(&result.output_location)
    .bind(&result.hardware_json)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("insert_result failed")?;
    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Stream events (append-only log/status per campaign or run)
// ---------------------------------------------------------------------------

/// Append an event with an auto-assigned, per-stream monotonic sequence.
/// Returns the assigned sequence.
pub async fn append_event(
    pool: &SqlitePool,
    stream_id: &str,
    kind: StreamEventKind,
    payload: &Value,
) -> Result<i64> {
    let (seq,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO stream_events (stream_id, seq, kind, payload, created_at)
        VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM stream_events WHERE stream_id = ?1), ?2, ?3, ?4)
        RETURNING seq
        "#,
    )
    .bind(stream_id)
    .bind(kind.as_str())
    .bind(payload)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("append_event failed")?;
    Ok(seq)
}

/// Events with `seq > after`, oldest first. Used for SSE resume via
/// `Last-Event-ID`.
pub async fn list_events_after(
    pool: &SqlitePool,
    stream_id: &str,
    after: i64,
    limit: i64,
) -> Result<Vec<StreamEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT stream_id, seq, kind, payload, created_at
          FROM stream_events
         WHERE stream_id = ?1 AND seq > ?2
         ORDER BY seq
         LIMIT ?3
        "#,
    )
    .bind(stream_id)
    .bind(after)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_events_after failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let kind_raw: String = row.try_get("kind")?;
        out.push(StreamEvent {
            stream_id: row.try_get("stream_id")?,
            sequence: row.try_get("seq")?,
            kind: StreamEventKind::parse(&kind_raw)
                .ok_or_else(|| anyhow!("invalid stream event kind: {kind_raw}"))?,
            payload: row.try_get("payload")?,
            timestamp: row.try_get("created_at")?,
        });
    }
    Ok(out)
}
