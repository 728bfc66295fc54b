//! Shared types for the KITT orchestration core.
//!
//! Everything that crosses a boundary lives here: run/campaign statuses, the
//! error taxonomy, campaign configuration, and the wire types exchanged
//! between server, agent, and CLI. All JSON field names are lower_snake_case
//! and timestamps are RFC 3339 UTC (`chrono` serde defaults).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a planned run.
///
/// Terminal statuses are immutable: the ledger refuses any transition out of
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Queued => "queued",
            RunStatus::Dispatched => "dispatched",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "queued" => Some(RunStatus::Queued),
            "dispatched" => Some(RunStatus::Dispatched),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Skipped | RunStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// CampaignStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Queued => "queued",
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "queued" => Some(CampaignStatus::Queued),
            "running" => Some(CampaignStatus::Running),
            "completed" => Some(CampaignStatus::Completed),
            "failed" => Some(CampaignStatus::Failed),
            "cancelled" => Some(CampaignStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// ErrorKind (the failure taxonomy)
// ---------------------------------------------------------------------------

/// Every terminal run carries one of these labels; UIs group and colour by
/// it. These are kinds, not types: a failure is a value on the run row, not
/// an exception in the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Conflict,
    NotFound,
    TransientRemote,
    Incompatible,
    ResourceExceeded,
    EngineError,
    Watchdog,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransientRemote => "transient_remote",
            ErrorKind::Incompatible => "incompatible",
            ErrorKind::ResourceExceeded => "resource_exceeded",
            ErrorKind::EngineError => "engine_error",
            ErrorKind::Watchdog => "watchdog",
            ErrorKind::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorKind::Validation),
            "auth" => Some(ErrorKind::Auth),
            "conflict" => Some(ErrorKind::Conflict),
            "not_found" => Some(ErrorKind::NotFound),
            "transient_remote" => Some(ErrorKind::TransientRemote),
            "incompatible" => Some(ErrorKind::Incompatible),
            "resource_exceeded" => Some(ErrorKind::ResourceExceeded),
            "engine_error" => Some(ErrorKind::EngineError),
            "watchdog" => Some(ErrorKind::Watchdog),
            "fatal" => Some(ErrorKind::Fatal),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Campaign configuration (input to the planner)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub safetensors_repo: Option<String>,
    #[serde(default)]
    pub gguf_repo: Option<String>,
    #[serde(default)]
    pub ollama_tag: Option<String>,
    #[serde(default)]
    pub estimated_size_gb: f64,
}

/// How the agent hosts the engine: a Docker container or a native process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Docker,
    Native,
}

impl Default for EngineMode {
    fn default() -> Self {
        EngineMode::Docker
    }
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Docker => "docker",
            EngineMode::Native => "native",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "docker" => Some(EngineMode::Docker),
            "native" => Some(EngineMode::Native),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSpec {
    pub name: String,
    #[serde(default = "default_suite")]
    pub suite: String,
    #[serde(default)]
    pub mode: EngineMode,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    /// Model formats this engine consumes. Empty means "use the built-in
    /// default for this engine name".
    #[serde(default)]
    pub formats: Vec<String>,
}

fn default_suite() -> String {
    "standard".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantFilterConfig {
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    #[serde(default)]
    pub include_only: Vec<String>,
}

/// Models/quants whose estimated loaded size exceeds `max_model_size_gb` are
/// skipped up-front. Zero disables the limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    #[serde(default)]
    pub max_model_size_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default = "default_reserve_gb")]
    pub reserve_gb: f64,
    #[serde(default = "default_true")]
    pub cleanup_after_run: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            reserve_gb: default_reserve_gb(),
            cleanup_after_run: true,
        }
    }
}

fn default_reserve_gb() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

/// Top-level campaign definition: a matrix of models × engines × benchmarks
/// plus filter and resource rules. Immutable once the campaign is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub engines: Vec<EngineSpec>,
    #[serde(default)]
    pub benchmarks: Vec<String>,
    #[serde(default)]
    pub quant_filter: QuantFilterConfig,
    #[serde(default)]
    pub resource_limits: ResourceLimitsConfig,
    #[serde(default)]
    pub disk: DiskConfig,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    RunContainer,
    StopContainer,
    CheckDocker,
    /// Legacy pathway: run the benchmark through the local `kitt run` CLI
    /// instead of orchestrating a container. Same payload fields.
    RunTest,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::RunContainer => "run_container",
            CommandType::StopContainer => "stop_container",
            CommandType::CheckDocker => "check_docker",
            CommandType::RunTest => "run_test",
        }
    }
}

/// Engine/model/suite specifics carried by a command. `stop_container` uses
/// only `target_command_id`; the run variants use the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub model_ref: String,
    #[serde(default)]
    pub engine_name: String,
    #[serde(default)]
    pub engine_mode: Option<EngineMode>,
    #[serde(default)]
    pub engine_config: BTreeMap<String, Value>,
    #[serde(default)]
    pub benchmark_name: String,
    #[serde(default)]
    pub suite_name: String,
    #[serde(default)]
    pub quant: String,
    #[serde(default)]
    pub include_pattern: Option<String>,
    /// For `stop_container`: the command whose container should be stopped.
    #[serde(default)]
    pub target_command_id: Option<String>,
}

/// A dispatched instruction to execute one planned run. Handed to at most
/// one heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: CommandPayload,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agent wire types
// ---------------------------------------------------------------------------

/// Capability snapshot sent with every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub hostname: String,
    /// Normalized: amd64, arm64, ...
    #[serde(default)]
    pub cpu_arch: String,
    #[serde(default)]
    pub gpu_info: String,
    #[serde(default)]
    pub gpu_count: i64,
    #[serde(default)]
    pub ram_gb: i64,
    #[serde(default)]
    pub kitt_version: String,
    #[serde(default)]
    pub hardware: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    /// Command ids currently executing on the agent. Non-empty means busy:
    /// the server must not hand out another command.
    #[serde(default)]
    pub active_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub agent_id: String,
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
}

fn default_agent_port() -> u16 {
    8090
}

/// Returned exactly once; the raw token is never stored server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub agent_id: String,
    pub name: String,
    pub token: String,
    pub token_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub cpu_arch: String,
    pub gpu_info: String,
    pub gpu_count: i64,
    pub ram_gb: i64,
    pub kitt_version: String,
    pub status: String,
    pub token_prefix: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agent → server callbacks
// ---------------------------------------------------------------------------

/// Mid-flight status callback (`dispatched → running`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusUpdate {
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLogLine {
    pub line: String,
}

/// Terminal report for a command. Written once; duplicates are no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub command_id: String,
    /// `completed` or `failed` from the agent's point of view.
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default)]
    pub output_location: Option<String>,
    /// Hardware snapshot from the executing agent at completion time.
    #[serde(default)]
    pub hardware: Value,
}

// ---------------------------------------------------------------------------
// Campaign snapshots (server → CLI/UI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: String,
    pub campaign_id: String,
    pub model_name: String,
    pub model_ref: String,
    pub engine_name: String,
    pub benchmark_name: String,
    pub suite_name: String,
    pub quant: String,
    pub estimated_size_gb: f64,
    pub status: RunStatus,
    pub command_id: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignAggregates {
    pub total_runs: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub cancelled: i64,
    pub pending_or_running: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub agent_id: Option<String>,
    pub aggregates: CampaignAggregates,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub runs: Vec<RunInfo>,
}

// ---------------------------------------------------------------------------
// Stream events (SSE wire)
// ---------------------------------------------------------------------------

/// Kind of a persisted stream event. The `dropped=n` back-pressure marker is
/// synthesized per subscriber and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Log,
    Status,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::Log => "log",
            StreamEventKind::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "log" => Some(StreamEventKind::Log),
            "status" => Some(StreamEventKind::Status),
            _ => None,
        }
    }
}

/// One append-only event on a campaign or run stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream_id: String,
    /// Monotonic per stream; carried as the SSE `id:` so clients can resume
    /// with `Last-Event-ID`.
    pub sequence: i64,
    pub kind: StreamEventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips() {
        for s in [
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Dispatched,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Skipped,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses_are_exactly_four() {
        let terminal: Vec<_> = [
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Dispatched,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Skipped,
            RunStatus::Cancelled,
        ]
        .into_iter()
        .filter(RunStatus::is_terminal)
        .collect();
        assert_eq!(
            terminal,
            vec![
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Skipped,
                RunStatus::Cancelled
            ]
        );
    }

    #[test]
    fn command_type_serializes_snake_case() {
        let cmd = Command {
            command_id: "c1".into(),
            agent_id: "a1".into(),
            command_type: CommandType::RunContainer,
            payload: CommandPayload::default(),
            created_at: Utc::now(),
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["type"], "run_container");
    }

    #[test]
    fn campaign_config_defaults_apply() {
        let cfg: CampaignConfig = serde_json::from_value(serde_json::json!({
            "name": "nightly",
            "models": [{"name": "llama3", "params": "8B", "gguf_repo": "org/llama3-gguf"}],
            "engines": [{"name": "llama_cpp"}],
            "benchmarks": ["throughput"]
        }))
        .unwrap();
        assert_eq!(cfg.engines[0].suite, "standard");
        assert_eq!(cfg.engines[0].mode, EngineMode::Docker);
        assert_eq!(cfg.resource_limits.max_model_size_gb, 0.0);
        assert!(cfg.disk.cleanup_after_run);
    }
}
