//! Command workers: one per dispatched command.
//!
//! A worker reports `running`, brings up the engine (container or native
//! process), streams log lines back to the server, and reports exactly one
//! terminal status. Cleanup runs on every exit path: a failed benchmark
//! still gets its container removed.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kitt_schemas::{Command, CommandPayload, CommandType, EngineMode, ErrorKind, ResultReport, RunStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::docker::DockerOps;
use crate::engines;
use crate::hardware;
use crate::report::ServerClient;

/// How many trailing log lines are kept for failure reports.
const LOG_TAIL_LINES: usize = 50;

// ---------------------------------------------------------------------------
// ActiveCommands
// ---------------------------------------------------------------------------

/// Commands currently executing on this agent, with the container each one
/// owns (when it owns one). Heartbeats report the key set; `stop_container`
/// commands resolve their target here.
#[derive(Clone, Default)]
pub struct ActiveCommands {
    inner: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl ActiveCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, command_id: &str) {
        self.lock().insert(command_id.to_string(), None);
    }

    pub fn set_container(&self, command_id: &str, container_id: &str) {
        if let Some(slot) = self.lock().get_mut(command_id) {
            *slot = Some(container_id.to_string());
        }
    }

    pub fn remove(&self, command_id: &str) -> Option<String> {
        self.lock().remove(command_id).flatten()
    }

    pub fn container_for(&self, command_id: &str) -> Option<String> {
        self.lock().get(command_id).cloned().flatten()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<String>>> {
        self.inner.lock().expect("active commands lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Worker entry
// ---------------------------------------------------------------------------

/// Execute one command to completion and report its terminal status. Never
/// returns an error: every failure becomes a `failed`/`skipped` report.
pub async fn execute(
    client: ServerClient,
    active: ActiveCommands,
    command: Command,
    health_wait: Duration,
) {
    let command_id = command.command_id.clone();
    tracing::info!(command = %command_id, kind = command.command_type.as_str(), "command started");

    let outcome = match command.command_type {
        CommandType::RunContainer => {
            run_engine_command(&client, &active, &command, health_wait).await
        }
        CommandType::RunTest => run_test_command(&client, &active, &command).await,
        CommandType::CheckDocker => check_docker_command().await,
        CommandType::StopContainer => stop_container_command(&active, &command.payload).await,
    };

    // Cleanup runs regardless of outcome.
    if let Some(container_id) = active.remove(&command_id) {
        DockerOps::stop_container(&container_id).await;
    }

    // Control commands have no planned run behind them; the server would
    // reject a result report. Their outcome only reaches the local log.
    if matches!(
        command.command_type,
        CommandType::StopContainer | CommandType::CheckDocker
    ) {
        match outcome {
            Ok(metrics) => {
                tracing::info!(command = %command_id, %metrics, "control command finished")
            }
            Err(failure) => tracing::warn!(
                command = %command_id,
                kind = failure.kind.as_str(),
                "control command failed: {}",
                failure.message
            ),
        }
        return;
    }

    let report = match outcome {
        Ok(metrics) => ResultReport {
            command_id: command_id.clone(),
            status: RunStatus::Completed,
            error: None,
            error_kind: None,
            metrics,
            output_location: None,
            hardware: hardware_snapshot().await,
        },
        Err(failure) => ResultReport {
            command_id: command_id.clone(),
            status: RunStatus::Failed,
            error: Some(failure.message),
            error_kind: Some(failure.kind),
            metrics: serde_json::json!({}),
            output_location: None,
            hardware: hardware_snapshot().await,
        },
    };

    if let Err(e) = client.post_result(&report).await {
        tracing::error!(command = %command_id, "result report permanently rejected: {e:#}");
    }
    tracing::info!(command = %command_id, status = report.status.as_str(), "command finished");
}

async fn hardware_snapshot() -> serde_json::Value {
    serde_json::to_value(hardware::detect_capabilities().await)
        .unwrap_or_else(|_| serde_json::json!({}))
}

/// A worker failure: taxonomy kind + human message (with log tail folded in
/// by the caller that has one).
struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Failure {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// run_container
// ---------------------------------------------------------------------------

async fn run_engine_command(
    client: &ServerClient,
    active: &ActiveCommands,
    command: &Command,
    health_wait: Duration,
) -> Result<serde_json::Value, Failure> {
    let payload = &command.payload;
    let Some(adapter) = engines::get(&payload.engine_name) else {
        return Err(Failure::new(
            ErrorKind::Incompatible,
            format!("unknown engine: {}", payload.engine_name),
        ));
    };

    if let Err(e) = client.post_running(&command.command_id).await {
        tracing::warn!(command = %command.command_id, "running callback rejected: {e:#}");
    }

    match payload.engine_mode.unwrap_or_default() {
        EngineMode::Docker => {
            run_docker_engine(client, active, command, adapter, health_wait).await
        }
        EngineMode::Native => run_native_engine(client, command, adapter, health_wait).await,
    }
}

async fn run_docker_engine(
    client: &ServerClient,
    active: &ActiveCommands,
    command: &Command,
    adapter: &engines::EngineAdapter,
    health_wait: Duration,
) -> Result<serde_json::Value, Failure> {
    let payload = &command.payload;

    if !DockerOps::is_available().await {
        return Err(Failure::new(
            ErrorKind::EngineError,
            "docker is not available on this agent",
        ));
    }

    let image = adapter.image(payload);
    let _ = client
        .post_log(&command.command_id, &format!("Pulling image: {image}"))
        .await;
    if let Err(e) = DockerOps::pull_image(&image, None).await {
        return Err(Failure::new(ErrorKind::EngineError, format!("image pull failed: {e:#}")));
    }

    // Refuse to start an image built for a different architecture.
    let host = DockerOps::host_arch().await;
    let img = DockerOps::image_arch(&image).await;
    if !host.is_empty() && !img.is_empty() && host != img {
        return Err(Failure::new(
            ErrorKind::Incompatible,
            format!("incompatible_architecture: image is {img}, host is {host}"),
        ));
    }

    let host_port = engines::host_port_for(adapter, payload);
    let spec = adapter.container_spec(payload, host_port);

    let _ = client.post_log(&command.command_id, "Starting container...").await;
    let container_id = DockerOps::run_container(&spec)
        .await
        .map_err(|e| Failure::new(ErrorKind::EngineError, format!("container start failed: {e:#}")))?;
    active.set_container(&command.command_id, &container_id);

    if !spec.health_url.is_empty() {
        let _ = client
            .post_log(&command.command_id, &format!("Waiting for health: {}", spec.health_url))
            .await;
        if !DockerOps::wait_for_healthy(&spec.health_url, health_wait).await {
            return Err(Failure::new(ErrorKind::EngineError, "health check timeout"));
        }
    }
    let _ = client
        .post_log(&command.command_id, &format!("Container healthy: {container_id}"))
        .await;

    // Stream container output until it exits; the container runs the
    // benchmark and its exit code is the verdict.
    let (tx, rx) = mpsc::channel::<String>(256);
    let cid = container_id.clone();
    let stream_task = tokio::spawn(async move { DockerOps::stream_logs(&cid, tx).await });
    let tail = forward_lines(client, &command.command_id, rx).await;

    let _ = stream_task.await;
    let _ = client
        .post_log(&command.command_id, "--- Container exited ---")
        .await;

    match DockerOps::container_exit_code(&container_id).await {
        Some(0) | None => Ok(serde_json::json!({ "container_id": container_id })),
        Some(code) => Err(Failure::new(
            ErrorKind::EngineError,
            format!("container exited with code {code}; tail: {}", tail.join(" | ")),
        )),
    }
}

async fn run_native_engine(
    client: &ServerClient,
    command: &Command,
    adapter: &engines::EngineAdapter,
    health_wait: Duration,
) -> Result<serde_json::Value, Failure> {
    let payload = &command.payload;
    let host_port = engines::host_port_for(adapter, payload);
    let Some(engine_spec) = adapter.native_spec(payload, host_port) else {
        return Err(Failure::new(
            ErrorKind::Incompatible,
            format!("engine {} does not support native mode", adapter.name),
        ));
    };

    // Engine process lives exactly as long as this worker; kill_on_drop
    // covers every exit path below.
    let mut engine_cmd = tokio::process::Command::new(&engine_spec.program);
    engine_cmd
        .args(&engine_spec.args)
        .envs(&engine_spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut engine = engine_cmd.spawn().map_err(|e| {
        Failure::new(
            ErrorKind::EngineError,
            format!("failed to start {}: {e}", engine_spec.program),
        )
    })?;
    drain_child_output(&mut engine);

    let health_url = adapter.health_url(host_port);
    if !DockerOps::wait_for_healthy(&health_url, health_wait).await {
        let _ = engine.kill().await;
        return Err(Failure::new(ErrorKind::EngineError, "health check timeout"));
    }
    let _ = client
        .post_log(&command.command_id, &format!("Engine healthy on port {host_port}"))
        .await;

    // Benchmark through the local CLI against the live engine.
    let result = run_benchmark_cli(client, command).await;
    let _ = engine.kill().await;
    result
}

/// Keep a child's pipes drained so it never blocks on a full pipe.
fn drain_child_output(child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "engine", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "engine", "{line}");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// run_test (legacy): benchmark through the local `kitt` CLI
// ---------------------------------------------------------------------------

async fn run_test_command(
    client: &ServerClient,
    _active: &ActiveCommands,
    command: &Command,
) -> Result<serde_json::Value, Failure> {
    if let Err(e) = client.post_running(&command.command_id).await {
        tracing::warn!(command = %command.command_id, "running callback rejected: {e:#}");
    }
    run_benchmark_cli(client, command).await
}

async fn run_benchmark_cli(
    client: &ServerClient,
    command: &Command,
) -> Result<serde_json::Value, Failure> {
    let payload: &CommandPayload = &command.payload;
    let spec = crate::process::ProcessSpec::new("kitt").args([
        "run".to_string(),
        "-m".to_string(),
        payload.model_ref.clone(),
        "-e".to_string(),
        payload.engine_name.clone(),
        "-s".to_string(),
        payload.suite_name.clone(),
    ]);

    let (tx, rx) = mpsc::channel::<String>(256);
    let run_task = {
        let spec = spec.clone();
        tokio::spawn(async move { crate::process::run_streaming(&spec, tx).await })
    };
    let tail = forward_lines(client, &command.command_id, rx).await;

    match run_task.await {
        Ok(Ok(0)) => Ok(serde_json::json!({})),
        Ok(Ok(code)) => Err(Failure::new(
            ErrorKind::EngineError,
            format!("benchmark exited with code {code}; tail: {}", tail.join(" | ")),
        )),
        Ok(Err(e)) => Err(Failure::new(
            ErrorKind::EngineError,
            format!("benchmark process failed: {e:#}"),
        )),
        Err(e) => Err(Failure::new(
            ErrorKind::EngineError,
            format!("benchmark task panicked: {e}"),
        )),
    }
}

/// Forward lines to the server as they arrive, keeping a bounded tail for
/// failure messages.
async fn forward_lines(
    client: &ServerClient,
    command_id: &str,
    mut rx: mpsc::Receiver<String>,
) -> Vec<String> {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(LOG_TAIL_LINES);
    while let Some(line) = rx.recv().await {
        if tail.len() == LOG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
        if let Err(e) = client.post_log(command_id, &line).await {
            tracing::warn!(command = command_id, "log line rejected: {e:#}");
        }
    }
    tail.into_iter().collect()
}

// ---------------------------------------------------------------------------
// check_docker / stop_container
// ---------------------------------------------------------------------------

async fn check_docker_command() -> Result<serde_json::Value, Failure> {
    Ok(serde_json::json!({ "docker_available": DockerOps::is_available().await }))
}

async fn stop_container_command(
    active: &ActiveCommands,
    payload: &CommandPayload,
) -> Result<serde_json::Value, Failure> {
    let Some(target) = payload.target_command_id.as_deref() else {
        return Err(Failure::new(
            ErrorKind::Validation,
            "stop_container requires target_command_id",
        ));
    };
    let Some(container_id) = active.container_for(target) else {
        return Err(Failure::new(
            ErrorKind::NotFound,
            format!("no active container for command {target}"),
        ));
    };
    let stopped = DockerOps::stop_container(&container_id).await;
    Ok(serde_json::json!({ "stopped": stopped, "container_id": container_id }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_commands_track_containers() {
        let active = ActiveCommands::new();
        active.insert("c1");
        assert_eq!(active.ids(), vec!["c1".to_string()]);
        assert_eq!(active.container_for("c1"), None);

        active.set_container("c1", "abc123");
        assert_eq!(active.container_for("c1").as_deref(), Some("abc123"));

        assert_eq!(active.remove("c1").as_deref(), Some("abc123"));
        assert!(active.ids().is_empty());
        assert_eq!(active.remove("c1"), None);
    }

    #[test]
    fn set_container_on_unknown_command_is_a_noop() {
        let active = ActiveCommands::new();
        active.set_container("ghost", "abc");
        assert_eq!(active.container_for("ghost"), None);
    }
}
