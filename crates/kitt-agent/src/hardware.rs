//! Capability snapshot sent with heartbeats and attached to results.

use std::time::Duration;

use kitt_schemas::AgentCapabilities;

use crate::docker::normalize_arch;
use crate::process::{run_capture, ProcessSpec};

/// Detect the host's capabilities. Best effort: a box without nvidia-smi
/// simply reports no GPUs.
pub async fn detect_capabilities() -> AgentCapabilities {
    let (gpu_info, gpu_count) = detect_gpus().await;
    AgentCapabilities {
        hostname: hostname(),
        cpu_arch: normalize_arch(std::env::consts::ARCH),
        gpu_info,
        gpu_count,
        ram_gb: ram_gb(),
        kitt_version: env!("CARGO_PKG_VERSION").to_string(),
        hardware: serde_json::json!({
            "os": std::env::consts::OS,
        }),
    }
}

fn hostname() -> String {
    if let Ok(h) = std::env::var("HOSTNAME") {
        if !h.is_empty() {
            return h;
        }
    }
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// ("NVIDIA RTX A6000 (48GB)", 2) from nvidia-smi, or empty without a GPU.
async fn detect_gpus() -> (String, i64) {
    let spec = ProcessSpec::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader"])
        .timeout(Duration::from_secs(10));
    let Ok(out) = run_capture(&spec).await else {
        return (String::new(), 0);
    };
    if !out.success() {
        return (String::new(), 0);
    }

    let lines: Vec<&str> = out.stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let count = lines.len() as i64;
    let info = lines.first().map(|l| summarize_gpu_line(l)).unwrap_or_default();
    (info, count)
}

/// "NVIDIA RTX A6000, 49140 MiB" → "NVIDIA RTX A6000 (48GB)".
fn summarize_gpu_line(line: &str) -> String {
    let mut parts = line.splitn(2, ',');
    let name = parts.next().unwrap_or("").trim();
    let mem = parts.next().unwrap_or("").trim();
    let gb = mem
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|mib| (mib / 1024.0).round() as i64);
    match gb {
        Some(gb) => format!("{name} ({gb}GB)"),
        None => name.to_string(),
    }
}

fn ram_gb() -> i64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: i64 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return kb / (1024 * 1024);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_line_summarizes_name_and_memory() {
        assert_eq!(
            summarize_gpu_line("NVIDIA RTX A6000, 49140 MiB"),
            "NVIDIA RTX A6000 (48GB)"
        );
        assert_eq!(summarize_gpu_line("Tesla T4"), "Tesla T4");
    }
}
