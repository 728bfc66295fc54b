//! Versioned schema migrations for the run ledger.
//!
//! Migrations are additive, applied in version order at startup. Each entry
//! is one atomic DDL+DML script executed inside a transaction; the applied
//! version is recorded in `schema_version`. Never edit an applied migration;
//! append a new one.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Highest known schema version. `migrate` brings any older database here.
pub const SCHEMA_VERSION: i64 = 2;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            hostname TEXT NOT NULL DEFAULT '',
            port INTEGER NOT NULL DEFAULT 8090,
            cpu_arch TEXT NOT NULL DEFAULT '',
            gpu_info TEXT NOT NULL DEFAULT '',
            gpu_count INTEGER NOT NULL DEFAULT 0,
            ram_gb INTEGER NOT NULL DEFAULT 0,
            kitt_version TEXT NOT NULL DEFAULT '',
            hardware_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'offline',
            last_heartbeat TEXT,
            token_hash TEXT NOT NULL,
            token_prefix TEXT NOT NULL DEFAULT '',
            registered_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            config_json TEXT NOT NULL,
            config_hash TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'draft',
            agent_id TEXT REFERENCES agents(id),
            total_runs INTEGER NOT NULL DEFAULT 0,
            succeeded INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            cancelled INTEGER NOT NULL DEFAULT 0,
            error TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS planned_runs (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id),
            plan_order INTEGER NOT NULL DEFAULT 0,
            model_name TEXT NOT NULL DEFAULT '',
            model_ref TEXT NOT NULL,
            engine_name TEXT NOT NULL,
            engine_mode TEXT NOT NULL DEFAULT 'docker',
            benchmark_name TEXT NOT NULL,
            suite_name TEXT NOT NULL DEFAULT 'standard',
            quant TEXT NOT NULL DEFAULT '',
            include_pattern TEXT,
            estimated_size_gb REAL NOT NULL DEFAULT 0.0,
            status TEXT NOT NULL DEFAULT 'pending',
            command_id TEXT,
            error_kind TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            queued_at TEXT,
            dispatched_at TEXT,
            started_at TEXT,
            completed_at TEXT,
            last_transition_at TEXT NOT NULL,
            UNIQUE(campaign_id, model_ref, engine_name, quant, benchmark_name)
        );

        CREATE TABLE IF NOT EXISTS run_results (
            run_id TEXT PRIMARY KEY REFERENCES planned_runs(id),
            command_id TEXT NOT NULL DEFAULT '',
            passed INTEGER NOT NULL DEFAULT 0,
            metrics_json TEXT NOT NULL DEFAULT '{}',
            output_location TEXT NOT NULL DEFAULT '',
            hardware_json TEXT NOT NULL DEFAULT '{}',
            reported_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stream_events (
            stream_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (stream_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);
        CREATE INDEX IF NOT EXISTS idx_campaigns_agent ON campaigns(agent_id);
        CREATE INDEX IF NOT EXISTS idx_planned_runs_campaign ON planned_runs(campaign_id, plan_order);
        CREATE INDEX IF NOT EXISTS idx_planned_runs_status ON planned_runs(status);
        CREATE INDEX IF NOT EXISTS idx_planned_runs_command ON planned_runs(command_id);
        CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status)
        "#,
    ),
    (
        2,
        r#"
        CREATE INDEX IF NOT EXISTS idx_stream_events_created ON stream_events(created_at)
        "#,
    ),
];

/// Apply all pending migrations, in version order, each in its own
/// transaction. Idempotent on an up-to-date database.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create schema_version table failed")?;

    let current = current_version(pool).await?;

    for (version, script) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let mut tx = pool.begin().await.context("begin migration tx failed")?;
        for stmt in script.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            sqlx::query(stmt)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration v{version} statement failed"))?;
        }
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
            .bind(version)
            .bind(chrono::Utc::now())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("record migration v{version} failed"))?;
        tx.commit()
            .await
            .with_context(|| format!("commit migration v{version} failed"))?;
    }

    Ok(())
}

/// Highest applied version, 0 for a fresh database.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let (version,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .context("read schema_version failed")?;
    Ok(version)
}
