use kitt_schemas::AgentInfo;

use crate::client::{Api, CliError};

pub async fn list(api: &Api) -> Result<(), CliError> {
    let agents: Vec<AgentInfo> = api.get("/agents").await?;

    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<10} {:<24} {:<10} {}",
        "NAME", "STATUS", "ARCH", "GPU", "TOKEN", "LAST HEARTBEAT"
    );
    for a in agents {
        let heartbeat = a
            .last_heartbeat
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .unwrap_or_else(|| "never".to_string());
        let gpu = if a.gpu_count > 1 {
            format!("{} x{}", a.gpu_info, a.gpu_count)
        } else {
            a.gpu_info.clone()
        };
        println!(
            "{:<20} {:<8} {:<10} {:<24} {:<10} {}",
            a.name,
            a.status,
            a.cpu_arch,
            gpu,
            format!("{}…", a.token_prefix),
            heartbeat
        );
    }
    Ok(())
}
