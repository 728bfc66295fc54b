//! Preflight prerequisite checks, run before the agent joins a server.

use std::time::Duration;

use crate::docker::DockerOps;
use crate::process::{run_capture, ProcessSpec};

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub required: bool,
    pub message: String,
}

impl CheckResult {
    fn new(name: &str, passed: bool, required: bool, message: impl Into<String>) -> Self {
        CheckResult {
            name: name.to_string(),
            passed,
            required,
            message: message.into(),
        }
    }
}

pub async fn check_docker_available() -> CheckResult {
    let ok = DockerOps::is_available().await;
    CheckResult::new(
        "Docker available",
        ok,
        true,
        if ok { "Available" } else { "docker info failed — is the daemon running?" },
    )
}

pub async fn check_docker_gpu() -> CheckResult {
    let spec = ProcessSpec::new("docker")
        .args([
            "run",
            "--rm",
            "--gpus",
            "all",
            "nvidia/cuda:12.0.0-base-ubuntu22.04",
            "nvidia-smi",
        ])
        .timeout(Duration::from_secs(120));
    match run_capture(&spec).await {
        Ok(out) if out.success() => {
            CheckResult::new("Docker GPU access", true, true, "GPU accessible in containers")
        }
        Ok(_) => CheckResult::new(
            "Docker GPU access",
            false,
            true,
            "No GPU access — check nvidia-container-toolkit",
        ),
        Err(e) => CheckResult::new("Docker GPU access", false, true, truncate(&format!("{e:#}"))),
    }
}

pub async fn check_nvidia_drivers() -> CheckResult {
    let spec = ProcessSpec::new("nvidia-smi").timeout(Duration::from_secs(10));
    match run_capture(&spec).await {
        Ok(out) if out.success() => {
            let driver_line = out
                .stdout
                .lines()
                .find(|l| l.contains("Driver Version"))
                .map(|l| l.trim().to_string())
                .unwrap_or_else(|| "Installed".to_string());
            CheckResult::new("NVIDIA drivers", true, true, driver_line)
        }
        Ok(_) => CheckResult::new("NVIDIA drivers", false, true, "nvidia-smi failed"),
        Err(_) => CheckResult::new(
            "NVIDIA drivers",
            false,
            true,
            "nvidia-smi not found — install NVIDIA drivers",
        ),
    }
}

/// Free space at the model storage path, via `df` (portable enough for the
/// hosts agents run on).
pub async fn check_disk_space(path: &str) -> CheckResult {
    let check_path = if path.is_empty() { "." } else { path };
    let spec = ProcessSpec::new("df")
        .args(["-Pk", check_path])
        .timeout(Duration::from_secs(10));
    match run_capture(&spec).await {
        Ok(out) if out.success() => {
            // "Filesystem 1024-blocks Used Available Capacity Mounted"
            let free_gb = out
                .stdout
                .lines()
                .nth(1)
                .and_then(|l| l.split_whitespace().nth(3))
                .and_then(|v| v.parse::<f64>().ok())
                .map(|kb| kb / (1024.0 * 1024.0))
                .unwrap_or(0.0);
            CheckResult::new(
                "Disk space (>= 50GB free)",
                free_gb >= 50.0,
                false,
                format!("{free_gb:.1}GB free at {check_path}"),
            )
        }
        _ => CheckResult::new("Disk space (>= 50GB free)", false, false, "df failed"),
    }
}

pub async fn check_server_reachable(server_url: &str) -> CheckResult {
    if server_url.is_empty() {
        return CheckResult::new("Server reachable", false, true, "No server URL provided");
    }
    let url = format!("{}/api/v1/health", server_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    match client
        .get(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            CheckResult::new("Server reachable", true, true, format!("{server_url} — OK"))
        }
        Ok(resp) => CheckResult::new(
            "Server reachable",
            false,
            true,
            format!("{server_url} — HTTP {}", resp.status()),
        ),
        Err(e) => CheckResult::new(
            "Server reachable",
            false,
            true,
            truncate(&format!("{server_url} — {e}")),
        ),
    }
}

pub fn check_port_available(port: u16) -> CheckResult {
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => CheckResult::new(
            &format!("Port {port} available"),
            true,
            false,
            format!("Port {port} is free"),
        ),
        Err(_) => CheckResult::new(
            &format!("Port {port} available"),
            false,
            false,
            format!("Port {port} is in use"),
        ),
    }
}

/// Run all preflight checks.
pub async fn run_all_checks(server_url: &str, port: u16, model_storage_dir: &str) -> Vec<CheckResult> {
    let mut results = vec![
        check_docker_available().await,
        check_docker_gpu().await,
        check_nvidia_drivers().await,
        check_disk_space(model_storage_dir).await,
    ];
    if !server_url.is_empty() {
        results.push(check_server_reachable(server_url).await);
    }
    if port != 0 {
        results.push(check_port_available(port));
    }
    results
}

/// Print results as a plain table; returns whether all required checks
/// passed.
pub fn print_results(results: &[CheckResult]) -> bool {
    println!();
    println!("KITT Agent Preflight Checks");
    println!("{}", "-".repeat(70));
    for r in results {
        let status = if r.passed {
            "PASS"
        } else if r.required {
            "FAIL"
        } else {
            "WARN"
        };
        let req = if r.required { "Req" } else { "Opt" };
        println!("  [{status}] [{req}] {}: {}", r.name, r.message);
    }
    println!();

    results.iter().filter(|r| r.required).all(|r| r.passed)
}

fn truncate(s: &str) -> String {
    s.chars().take(80).collect()
}
