//! Structured process execution.
//!
//! Everything the agent runs goes through a `ProcessSpec` (program, args,
//! env, timeout) executed by one runner. The runner enforces the blocked
//! Docker flag policy before exec and captures output line by line. No
//! string-concatenated shell commands anywhere.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Docker arguments the agent refuses to pass through, ever.
pub const BLOCKED_DOCKER_FLAGS: &[&str] = &[
    "--privileged",
    "--pid",
    "--cap-add",
    "--security-opt",
    "--device",
];

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        ProcessSpec {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env_var(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.insert(k.into(), v.into());
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Reject any argument starting with a blocked Docker flag.
pub fn check_blocked_flags(args: &[String]) -> Result<()> {
    for arg in args {
        if BLOCKED_DOCKER_FLAGS.iter().any(|flag| arg.starts_with(flag)) {
            return Err(anyhow!("blocked docker flag: {arg}"));
        }
    }
    Ok(())
}

/// Redact `-e KEY=value` pairs so env secrets never reach logs.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut safe = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            let key = arg.split_once('=').map(|(k, _)| k).unwrap_or(arg);
            safe.push(format!("{key}=***"));
            redact_next = false;
        } else {
            if arg == "-e" || arg == "--env" {
                redact_next = true;
            }
            safe.push(arg.clone());
        }
    }
    safe
}

/// Run to completion, capturing stdout and stderr.
pub async fn run_capture(spec: &ProcessSpec) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let fut = cmd.output();
    let output = match spec.timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", spec.program, t))?,
        None => fut.await,
    }
    .with_context(|| format!("failed to run {}", spec.program))?;

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run with stdout and stderr forwarded line by line into `lines` as they
/// arrive. Returns the exit code.
pub async fn run_streaming(spec: &ProcessSpec, lines: mpsc::Sender<String>) -> Result<i32> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.program))?;

    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;

    let out_tx = lines.clone();
    let out_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if out_tx.send(line).await.is_err() {
                break;
            }
        }
    });
    let err_tx = lines;
    let err_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if err_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let status = match spec.timeout {
        Some(t) => match tokio::time::timeout(t, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.kill().await;
                return Err(anyhow!("{} timed out after {:?}", spec.program, t));
            }
        },
        None => child.wait().await,
    }
    .with_context(|| format!("failed to wait on {}", spec.program))?;

    let _ = out_task.await;
    let _ = err_task.await;

    Ok(status.code().unwrap_or(-1))
}
