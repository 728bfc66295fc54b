use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use kitt_schemas::{CampaignSnapshot, RunStatus};
use serde::Deserialize;

use crate::client::{Api, CliError};

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StartedResponse {
    total_runs: i64,
    #[serde(default)]
    plan_skips: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryRow {
    id: String,
    name: String,
    status: String,
    total_runs: i64,
    succeeded: i64,
    failed: i64,
}

pub async fn run(
    api: &Api,
    file: &str,
    agent: &str,
    watch: bool,
    watch_timeout_secs: u64,
) -> Result<(), CliError> {
    if agent.is_empty() {
        return Err(CliError::user("an agent name is required (--agent)"));
    }

    let (config, _loaded) = kitt_config::load_campaign_config(Path::new(file))
        .map_err(|e| CliError::user(format!("{e:#}")))?;

    println!("Campaign: {}", config.name);
    println!("  Models:     {}", config.models.len());
    println!("  Engines:    {}", config.engines.len());
    println!("  Benchmarks: {}", config.benchmarks.len());
    println!("  Agent:      {agent}");
    println!();

    let created: CreatedResponse = api
        .post(
            "/campaigns",
            &serde_json::json!({ "agent_name": agent, "config": config }),
        )
        .await?;
    let started: StartedResponse = api
        .post_empty(&format!("/campaigns/{}/start", created.id))
        .await?;

    println!("Started campaign {} ({} runs planned)", created.id, started.total_runs);
    for skip in &started.plan_skips {
        println!("  {skip}");
    }

    if !watch {
        println!();
        println!("Follow with: kitt campaign status {}", created.id);
        return Ok(());
    }

    watch_campaign(api, &created.id, watch_timeout_secs).await
}

async fn watch_campaign(api: &Api, id: &str, timeout_secs: u64) -> Result<(), CliError> {
    let started = std::time::Instant::now();
    let mut last_line = String::new();

    loop {
        let snap: CampaignSnapshot = api.get(&format!("/campaigns/{id}")).await?;
        let a = &snap.aggregates;
        let line = format!(
            "{} | {}/{} done | {} ok, {} failed, {} skipped",
            snap.status.as_str(),
            a.total_runs - a.pending_or_running,
            a.total_runs,
            a.succeeded,
            a.failed,
            a.skipped,
        );
        if line != last_line {
            println!("{line}");
            last_line = line;
        }

        if snap.status.is_terminal() {
            print_summary(&snap);
            return Ok(());
        }
        if timeout_secs > 0 && started.elapsed() >= Duration::from_secs(timeout_secs) {
            return Err(CliError::timeout(format!(
                "campaign {id} still {} after {timeout_secs}s",
                snap.status.as_str()
            )));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

pub async fn status(api: &Api, campaign_id: Option<&str>) -> Result<(), CliError> {
    let id = match campaign_id {
        Some(id) => id.to_string(),
        None => {
            let all: Vec<SummaryRow> = api.get("/campaigns").await?;
            let Some(latest) = all.first() else {
                println!("No campaigns found.");
                return Ok(());
            };
            println!(
                "Latest: {} ({}) — {} | runs: {} | ok: {} | failed: {}",
                latest.name,
                latest.id,
                latest.status,
                latest.total_runs,
                latest.succeeded,
                latest.failed
            );
            latest.id.clone()
        }
    };

    let snap: CampaignSnapshot = api.get(&format!("/campaigns/{id}")).await?;
    print_summary(&snap);
    Ok(())
}

fn print_summary(snap: &CampaignSnapshot) {
    let a = &snap.aggregates;
    println!();
    println!("Campaign: {}", snap.name);
    println!("  ID:     {}", snap.id);
    println!("  Status: {}", snap.status.as_str());
    println!(
        "  Total: {} | Success: {} | Failed: {} | Skipped: {} | Cancelled: {} | In flight: {}",
        a.total_runs, a.succeeded, a.failed, a.skipped, a.cancelled, a.pending_or_running
    );

    // Failed runs plus the dominant failure kinds.
    let failed: Vec<_> = snap
        .runs
        .iter()
        .filter(|r| r.status == RunStatus::Failed)
        .collect();
    if !failed.is_empty() {
        let mut kinds: HashMap<&str, usize> = HashMap::new();
        for r in &failed {
            let kind = r.error_kind.map(|k| k.as_str()).unwrap_or("unknown");
            *kinds.entry(kind).or_default() += 1;
        }
        let mut kinds: Vec<_> = kinds.into_iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        println!();
        println!(
            "  Top failure kinds: {}",
            kinds
                .iter()
                .take(3)
                .map(|(k, n)| format!("{k} ({n})"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!("  Failed runs:");
        for r in failed {
            let error = r.error.as_deref().unwrap_or("");
            let error: String = error.chars().take(80).collect();
            println!(
                "    {} / {} / {} / {}: {}",
                r.model_name, r.engine_name, r.quant, r.benchmark_name, error
            );
        }
    }
}

pub async fn cancel(api: &Api, campaign_id: &str) -> Result<(), CliError> {
    let resp: serde_json::Value = api
        .post_empty(&format!("/campaigns/{campaign_id}/cancel"))
        .await?;
    println!(
        "Campaign {campaign_id} → {}",
        resp.get("status").and_then(|s| s.as_str()).unwrap_or("cancelled")
    );
    Ok(())
}
