//! Shared runtime state for kitt-server.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The state holds typed
//! handles to the ledger, event bus, dispatch queues, executor registry, and
//! model catalog. Every collaborator is explicit, nothing is looked up by
//! name.

use std::sync::Arc;

use anyhow::Result;
use kitt_bus::EventBus;
use kitt_config::ServerSettings;
use kitt_planner::{HttpCatalog, ModelCatalog};
use kitt_schemas::StreamEventKind;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::auth::RejectLog;
use crate::dispatch::DispatchQueues;
use crate::executor::ExecutorRegistry;

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers and background
/// workers.
pub struct AppState {
    /// The run ledger.
    pub db: SqlitePool,
    /// Live log/status fan-out to SSE subscribers.
    pub bus: EventBus,
    /// Per-agent pending command FIFOs.
    pub dispatch: DispatchQueues,
    /// One executor per running campaign.
    pub executors: ExecutorRegistry,
    /// Quant/tag discovery used by the planner.
    pub catalog: Arc<dyn ModelCatalog>,
    pub settings: ServerSettings,
    pub build: BuildInfo,
    /// Rate limiter for auth-rejection logging.
    pub reject_log: RejectLog,
}

impl AppState {
    pub fn new(db: SqlitePool, settings: ServerSettings) -> Arc<Self> {
        Self::with_catalog(db, settings, Arc::new(HttpCatalog::new()))
    }

    /// Constructor with an injected catalog (tests use a static one).
    pub fn with_catalog(
        db: SqlitePool,
        settings: ServerSettings,
        catalog: Arc<dyn ModelCatalog>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            db,
            bus: EventBus::new(settings.subscriber_capacity),
            dispatch: DispatchQueues::new(settings.dispatch_capacity),
            executors: ExecutorRegistry::new(),
            catalog,
            settings,
            build: BuildInfo {
                service: "kitt-server",
                version: env!("CARGO_PKG_VERSION"),
            },
            reject_log: RejectLog::new(),
        })
    }

    /// Persist an event on a stream, then fan it out to live subscribers.
    /// The ledger write is the ordering authority: the bus re-broadcasts the
    /// assigned sequence.
    pub async fn publish_event(
        &self,
        stream_id: &str,
        kind: StreamEventKind,
        payload: Value,
    ) -> Result<i64> {
        let seq = kitt_db::append_event(&self.db, stream_id, kind, &payload).await?;
        self.bus.publish_parts(stream_id, seq, kind, payload);
        Ok(seq)
    }

    /// Human-readable progress line on a stream (campaign or run).
    pub async fn publish_log(&self, stream_id: &str, line: impl Into<String>) -> Result<i64> {
        let line = line.into();
        self.publish_event(
            stream_id,
            StreamEventKind::Log,
            serde_json::json!({ "line": line }),
        )
        .await
    }
}
