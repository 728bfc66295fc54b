//! Shared helpers for server scenario tests.
//!
//! These tests spin up the Axum router **without** binding a TCP socket:
//! each request goes through `tower::ServiceExt::oneshot` against a router
//! built from shared state, so the executor and handlers interleave exactly
//! as they would in production.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use kitt_config::ServerSettings;
use kitt_planner::StaticCatalog;
use kitt_schemas::{CampaignStatus, ResultReport, RunStatus};
use kitt_server::{routes, state::AppState};
use tower::ServiceExt; // oneshot

pub struct TestServer {
    pub state: Arc<AppState>,
    _dir: tempfile::TempDir,
}

/// Settings tuned for tests: short run timeout so watchdog paths settle in
/// test time.
pub fn test_settings() -> ServerSettings {
    let mut s = ServerSettings::default();
    s.run_timeout = Duration::from_secs(30);
    s
}

pub async fn make_server(settings: ServerSettings, catalog: StaticCatalog) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.db");
    let pool = kitt_db::connect(path.to_str().expect("utf8 path"))
        .await
        .expect("connect test ledger");
    TestServer {
        state: AppState::with_catalog(pool, settings, Arc::new(catalog)),
        _dir: dir,
    }
}

impl TestServer {
    pub fn router(&self) -> axum::Router {
        routes::build_router(Arc::clone(&self.state))
    }

    /// Drive one request and return (status, parsed JSON body).
    pub async fn call(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(json.to_string()))
                .expect("request"),
            None => builder.body(axum::body::Body::empty()).expect("request"),
        };

        let resp = self
            .router()
            .oneshot(request)
            .await
            .expect("oneshot failed");
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .expect("body collect failed")
            .to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    /// Provision an agent, returning (agent_id, raw_token).
    pub async fn provision_agent(&self, name: &str) -> (String, String) {
        let (status, body) = self
            .call(
                "POST",
                "/api/v1/agents/provision",
                None,
                Some(serde_json::json!({"name": name, "hostname": "gpu-box", "port": 8090})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "provision failed: {body}");
        (
            body["agent_id"].as_str().expect("agent_id").to_string(),
            body["token"].as_str().expect("token").to_string(),
        )
    }

    /// Create + start a campaign targeted at `agent_name`; returns its id.
    pub async fn start_campaign(
        &self,
        agent_name: &str,
        config: serde_json::Value,
    ) -> String {
        let (status, body) = self
            .call(
                "POST",
                "/api/v1/campaigns",
                None,
                Some(serde_json::json!({"agent_name": agent_name, "config": config})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
        let id = body["id"].as_str().expect("campaign id").to_string();

        let (status, body) = self
            .call("POST", &format!("/api/v1/campaigns/{id}/start"), None, None)
            .await;
        assert_eq!(status, StatusCode::OK, "start failed: {body}");
        id
    }

    /// One heartbeat as `name`; returns the command object (or Null).
    pub async fn heartbeat(&self, name: &str, token: &str) -> serde_json::Value {
        let (status, body) = self
            .call(
                "POST",
                &format!("/api/v1/agents/{name}/heartbeat"),
                Some(token),
                Some(serde_json::json!({
                    "capabilities": {"cpu_arch": "amd64", "kitt_version": "test"},
                    "active_commands": []
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "heartbeat failed: {body}");
        body["command"].clone()
    }

    /// Heartbeat until a command is handed out, with a bounded wait.
    pub async fn heartbeat_until_command(&self, name: &str, token: &str) -> serde_json::Value {
        for _ in 0..100 {
            let command = self.heartbeat(name, token).await;
            if !command.is_null() {
                return command;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no command dispatched within the wait budget");
    }

    /// Simulate a full agent-side run of one command: running callback, one
    /// log line, then a terminal report.
    pub async fn complete_command(
        &self,
        name: &str,
        token: &str,
        command_id: &str,
        status: RunStatus,
    ) {
        let (code, body) = self
            .call(
                "POST",
                &format!("/api/v1/commands/{command_id}/status"),
                Some(token),
                Some(serde_json::json!({"status": "running"})),
            )
            .await;
        assert_eq!(code, StatusCode::OK, "running callback failed: {body}");

        let (code, _) = self
            .call(
                "POST",
                &format!("/api/v1/commands/{command_id}/log"),
                Some(token),
                Some(serde_json::json!({"line": "benchmark output"})),
            )
            .await;
        assert_eq!(code, StatusCode::OK);

        let report = ResultReport {
            command_id: command_id.to_string(),
            status,
            error: (status == RunStatus::Failed).then(|| "engine blew up".to_string()),
            error_kind: None,
            metrics: serde_json::json!({"tokens_per_second": 17.3}),
            output_location: None,
            hardware: serde_json::json!({"gpu": "test"}),
        };
        let (code, body) = self
            .call(
                "POST",
                &format!("/api/v1/agents/{name}/results"),
                Some(token),
                Some(serde_json::to_value(&report).expect("report json")),
            )
            .await;
        assert_eq!(code, StatusCode::OK, "result report failed: {body}");
    }

    /// Poll the campaign until it is terminal AND every run has settled.
    /// (A cancelled campaign turns terminal at the cancel request, while
    /// the executor is still marking the remaining runs.)
    pub async fn wait_for_campaign_terminal(&self, id: &str) -> serde_json::Value {
        for _ in 0..200 {
            let (status, snap) = self
                .call("GET", &format!("/api/v1/campaigns/{id}"), None, None)
                .await;
            assert_eq!(status, StatusCode::OK);
            let state = snap["status"].as_str().unwrap_or("");
            let settled = snap["aggregates"]["pending_or_running"] == 0;
            if let Some(parsed) = CampaignStatus::parse(state) {
                if parsed.is_terminal() && settled {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("campaign {id} did not settle in time");
    }
}

/// Minimal one-model / one-engine / one-benchmark config against an Ollama
/// tag the static catalog resolves to itself.
pub fn single_run_config() -> serde_json::Value {
    serde_json::json!({
        "name": "smoke",
        "models": [{"name": "qwen2", "params": "7B", "ollama_tag": "qwen2:7b"}],
        "engines": [{"name": "ollama", "suite": "quick"}],
        "benchmarks": ["throughput"]
    })
}

pub fn catalog_for_single_run() -> StaticCatalog {
    StaticCatalog::new().with_ollama_tags("qwen2", &["7b"])
}
