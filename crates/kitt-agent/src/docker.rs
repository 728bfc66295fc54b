//! Docker container management via the Docker CLI (no SDK dependency).

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::process::{check_blocked_flags, redact_args, run_capture, run_streaming, ProcessSpec};

/// Docker and the kernel use different names for the same architectures.
/// Normalize to Docker conventions (amd64, arm64) for consistent comparison.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Specification for running a Docker container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub port: u16,
    pub container_port: u16,
    pub gpu: bool,
    pub volumes: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub extra_args: Vec<String>,
    pub command_args: Vec<String>,
    pub name: String,
    pub health_url: String,
}

pub struct DockerOps;

impl DockerOps {
    /// Check if Docker is installed and the daemon is running.
    pub async fn is_available() -> bool {
        let spec = ProcessSpec::new("docker")
            .arg("info")
            .timeout(Duration::from_secs(10));
        matches!(run_capture(&spec).await, Ok(out) if out.success())
    }

    pub async fn image_exists(image: &str) -> bool {
        let spec = ProcessSpec::new("docker")
            .args(["image", "inspect", image])
            .timeout(Duration::from_secs(10));
        matches!(run_capture(&spec).await, Ok(out) if out.success())
    }

    /// Normalized architecture of a local image ('amd64', 'arm64'), empty on
    /// failure.
    pub async fn image_arch(image: &str) -> String {
        let spec = ProcessSpec::new("docker")
            .args(["image", "inspect", "--format", "{{.Architecture}}", image])
            .timeout(Duration::from_secs(10));
        match run_capture(&spec).await {
            Ok(out) if out.success() => normalize_arch(out.stdout.trim()),
            _ => String::new(),
        }
    }

    /// Normalized host architecture as Docker reports it.
    pub async fn host_arch() -> String {
        let spec = ProcessSpec::new("docker")
            .args(["info", "--format", "{{.Architecture}}"])
            .timeout(Duration::from_secs(10));
        match run_capture(&spec).await {
            Ok(out) if out.success() => normalize_arch(out.stdout.trim()),
            _ => String::new(),
        }
    }

    pub async fn pull_image(image: &str, platform: Option<&str>) -> Result<()> {
        tracing::info!(image, platform = platform.unwrap_or("default"), "pulling image");
        let mut spec = ProcessSpec::new("docker").arg("pull");
        if let Some(p) = platform {
            spec = spec.args(["--platform", p]);
        }
        spec = spec.arg(image).timeout(Duration::from_secs(600));

        let out = run_capture(&spec).await?;
        if !out.success() {
            return Err(anyhow!("docker pull failed: {}", out.stderr.trim()));
        }
        Ok(())
    }

    /// Start a container detached and return the (short) container id.
    /// Blocked flags in `extra_args` abort before exec.
    pub async fn run_container(spec: &ContainerSpec) -> Result<String> {
        check_blocked_flags(&spec.extra_args)?;

        let name = if spec.name.is_empty() {
            format!("kitt-agent-{}", chrono::Utc::now().timestamp())
        } else {
            spec.name.clone()
        };

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
        ];
        if spec.gpu {
            args.push("--gpus".to_string());
            args.push("all".to_string());
        }
        if spec.port != 0 && spec.container_port != 0 {
            args.push("-p".to_string());
            args.push(format!("{}:{}", spec.port, spec.container_port));
        }
        for (host_path, container_path) in &spec.volumes {
            args.push("-v".to_string());
            args.push(format!("{host_path}:{container_path}"));
        }
        for (key, val) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={val}"));
        }
        args.extend(spec.extra_args.iter().cloned());
        args.push(spec.image.clone());
        args.extend(spec.command_args.iter().cloned());

        tracing::info!("starting container: docker {}", redact_args(&args).join(" "));

        let proc = ProcessSpec::new("docker")
            .args(args)
            .timeout(Duration::from_secs(60));
        let out = run_capture(&proc).await?;
        if !out.success() {
            return Err(anyhow!("container start failed: {}", out.stderr.trim()));
        }

        let container_id: String = out.stdout.trim().chars().take(12).collect();
        tracing::info!(container = %container_id, name = %name, "container started");
        Ok(container_id)
    }

    /// Stop and remove a container. Best effort on stop; the force-remove is
    /// what must succeed.
    pub async fn stop_container(container_id: &str) -> bool {
        tracing::info!(container = container_id, "stopping container");
        let _ = run_capture(
            &ProcessSpec::new("docker")
                .args(["stop", container_id])
                .timeout(Duration::from_secs(30)),
        )
        .await;
        matches!(
            run_capture(
                &ProcessSpec::new("docker")
                    .args(["rm", "-f", container_id])
                    .timeout(Duration::from_secs(15)),
            )
            .await,
            Ok(out) if out.success()
        )
    }

    /// Follow container logs, one line per send, until the container exits.
    pub async fn stream_logs(container_id: &str, lines: mpsc::Sender<String>) -> Result<i32> {
        let spec = ProcessSpec::new("docker").args(["logs", "-f", container_id]);
        run_streaming(&spec, lines).await
    }

    /// Exit code of a finished container, if it has one.
    pub async fn container_exit_code(container_id: &str) -> Option<i32> {
        let spec = ProcessSpec::new("docker")
            .args(["inspect", "-f", "{{.State.ExitCode}}", container_id])
            .timeout(Duration::from_secs(10));
        match run_capture(&spec).await {
            Ok(out) if out.success() => out.stdout.trim().parse().ok(),
            _ => None,
        }
    }

    pub async fn container_running(container_id: &str) -> bool {
        let spec = ProcessSpec::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", container_id])
            .timeout(Duration::from_secs(10));
        matches!(
            run_capture(&spec).await,
            Ok(out) if out.success() && out.stdout.trim() == "true"
        )
    }

    /// Poll a health URL until it answers with a non-5xx status. Exponential
    /// backoff, base 2, capped at 10 s between attempts, bounded by
    /// `total_timeout` overall.
    pub async fn wait_for_healthy(url: &str, total_timeout: Duration) -> bool {
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + total_timeout;
        let mut interval = Duration::from_secs(2);

        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = client
                .get(url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                if resp.status().as_u16() < 500 {
                    return true;
                }
            }
            tokio::time::sleep(interval.min(Duration::from_secs(10))).await;
            interval = (interval * 2).min(Duration::from_secs(10));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_normalization() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("amd64"), "amd64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }
}
