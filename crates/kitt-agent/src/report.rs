//! HTTP client for agent → server callbacks.
//!
//! Heartbeats fail fast (the loop itself is the retry). Status callbacks,
//! log lines, and terminal results retry with jittered exponential backoff
//! capped at 30 s per attempt and never give up: results must not be lost
//! to a server restart. Permanent rejections (4xx) stop the retry loop;
//! they mean the request itself is wrong.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kitt_schemas::{
    CommandLogLine, CommandStatusUpdate, HeartbeatRequest, HeartbeatResponse, ResultReport,
    RunStatus,
};
use rand::Rng;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base: String,
    token: String,
    agent_name: String,
}

impl ServerClient {
    pub fn new(server_url: &str, token: &str, agent_name: &str) -> Self {
        ServerClient {
            http: reqwest::Client::builder()
                .user_agent(concat!("kitt-agent/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            base: server_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            agent_name: agent_name.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base)
    }

    async fn post_once<T: serde::Serialize>(&self, url: &str, body: &T) -> Result<reqwest::Response> {
        self.http
            .post(url)
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))
    }

    /// One heartbeat round-trip. Errors surface to the command loop, which
    /// owns the retry cadence.
    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = self.url(&format!("/agents/{}/heartbeat", self.agent_name));
        let resp = self.post_once(&url, req).await?;
        if !resp.status().is_success() {
            return Err(anyhow!("heartbeat rejected: HTTP {}", resp.status()));
        }
        resp.json().await.context("parse heartbeat response")
    }

    /// POST until the server accepts it. Jittered exponential backoff; 4xx
    /// is treated as permanent and returned as an error.
    async fn post_until_accepted<T: serde::Serialize>(&self, url: &str, body: &T) -> Result<()> {
        let mut backoff = BACKOFF_BASE;
        loop {
            match self.post_once(url, body).await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(anyhow!("server rejected request: HTTP {}", resp.status()));
                }
                Ok(resp) => {
                    tracing::warn!(%url, status = %resp.status(), "server error, retrying");
                }
                Err(e) => {
                    tracing::warn!(%url, "request failed, retrying: {e:#}");
                }
            }
            tokio::time::sleep(with_jitter(backoff)).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Report the run as started.
    pub async fn post_running(&self, command_id: &str) -> Result<()> {
        let url = self.url(&format!("/commands/{command_id}/status"));
        self.post_until_accepted(
            &url,
            &CommandStatusUpdate {
                status: RunStatus::Running,
                error: None,
            },
        )
        .await
    }

    /// Stream one log line. UTF-8, one line per call.
    pub async fn post_log(&self, command_id: &str, line: &str) -> Result<()> {
        let url = self.url(&format!("/commands/{command_id}/log"));
        self.post_until_accepted(
            &url,
            &CommandLogLine {
                line: line.to_string(),
            },
        )
        .await
    }

    /// Terminal report. The server deduplicates by command id, so retrying a
    /// possibly-delivered report is safe.
    pub async fn post_result(&self, report: &ResultReport) -> Result<()> {
        let url = self.url(&format!("/agents/{}/results", self.agent_name));
        self.post_until_accepted(&url, report).await
    }
}

/// Full jitter: a uniform draw from [base/2, base].
fn with_jitter(base: Duration) -> Duration {
    let half = base / 2;
    half + rand::thread_rng().gen_range(Duration::ZERO..=half)
}
