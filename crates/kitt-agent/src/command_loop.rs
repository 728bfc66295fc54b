//! The agent's primary loop: heartbeat, fetch command, spawn worker.

use std::time::Duration;

use anyhow::Result;
use kitt_schemas::HeartbeatRequest;
use rand::Rng;

use crate::hardware;
use crate::report::ServerClient;
use crate::worker::{self, ActiveCommands};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub server_url: String,
    pub token: String,
    /// Heartbeat cadence (recommended 5–10 s).
    pub heartbeat_interval: Duration,
    /// Total budget for an engine's health endpoint to come up.
    pub health_wait: Duration,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, server_url: impl Into<String>, token: impl Into<String>) -> Self {
        AgentConfig {
            name: name.into(),
            server_url: server_url.into(),
            token: token.into(),
            heartbeat_interval: Duration::from_secs(5),
            health_wait: Duration::from_secs(600),
        }
    }
}

/// Run the heartbeat loop until the process is shut down.
///
/// Each heartbeat carries a fresh capability snapshot plus the set of
/// commands still executing; the server hands out at most one new command
/// per round and nothing while the agent is busy. Heartbeat failures back
/// off with jitter (capped at 30 s) and never give up.
pub async fn run(cfg: AgentConfig) -> Result<()> {
    let client = ServerClient::new(&cfg.server_url, &cfg.token, &cfg.name);
    let active = ActiveCommands::new();

    tracing::info!(
        agent = %cfg.name,
        server = %cfg.server_url,
        interval_secs = cfg.heartbeat_interval.as_secs(),
        "agent loop starting"
    );

    let mut backoff = Duration::from_secs(1);
    loop {
        let req = HeartbeatRequest {
            capabilities: hardware::detect_capabilities().await,
            active_commands: active.ids(),
        };

        match client.heartbeat(&req).await {
            Ok(resp) => {
                backoff = Duration::from_secs(1);
                if let Some(command) = resp.command {
                    tracing::info!(
                        command = %command.command_id,
                        kind = command.command_type.as_str(),
                        "command received"
                    );
                    active.insert(&command.command_id);
                    tokio::spawn(worker::execute(
                        client.clone(),
                        active.clone(),
                        command,
                        cfg.health_wait,
                    ));
                }
                tokio::time::sleep(cfg.heartbeat_interval).await;
            }
            Err(e) => {
                tracing::warn!("heartbeat failed: {e:#}");
                let jitter = rand::thread_rng().gen_range(Duration::ZERO..=backoff / 2);
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}
