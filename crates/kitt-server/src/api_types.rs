//! Request/response bodies specific to the HTTP surface. Shared wire types
//! (heartbeats, commands, reports) live in `kitt-schemas`.

use chrono::{DateTime, Utc};
use kitt_schemas::CampaignConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Uniform error body; `kind` is one of the error-taxonomy labels.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    /// Target agent by id or by name (one of the two).
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    pub config: CampaignConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignCreatedResponse {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignStartedResponse {
    pub id: String,
    pub status: String,
    pub total_runs: i64,
    /// (model, engine) pairs the planner could not produce runs for.
    pub plan_skips: Vec<String>,
}

/// List-view row: the denormalized aggregate columns, no per-run detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    pub agent_id: Option<String>,
    pub total_runs: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub cancelled: i64,
    pub created_at: DateTime<Utc>,
}

/// Optional cancel body. `stop_current` additionally enqueues a
/// `stop_container` command for the in-flight run; by default the agent is
/// left to finish it.
#[derive(Debug, Default, Deserialize)]
pub struct CancelCampaignRequest {
    #[serde(default)]
    pub stop_current: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignCancelResponse {
    pub id: String,
    pub status: String,
    /// command_id of the stop command, when one was enqueued.
    pub stop_command: Option<String>,
}

/// Terminal-report acknowledgement. `duplicate` marks a replayed report that
/// changed nothing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultAcceptedResponse {
    pub accepted: bool,
    pub duplicate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogAppendedResponse {
    pub sequence: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdatedResponse {
    pub updated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub removed: bool,
}
