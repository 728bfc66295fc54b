use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use kitt_agent::{command_loop, preflight};

#[derive(Parser)]
#[command(name = "kitt-agent")]
#[command(about = "KITT benchmark agent - runs engine commands from a KITT server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a server and process commands until stopped.
    Run {
        /// Agent name as provisioned on the server
        #[arg(long, env = "KITT_AGENT_NAME")]
        name: String,

        /// Server base URL, e.g. https://kitt.example.com:8088
        #[arg(long, env = "KITT_SERVER_URL")]
        server: String,

        /// Raw agent token from provisioning
        #[arg(long, env = "KITT_AGENT_TOKEN")]
        token: String,

        /// Heartbeat interval in seconds
        #[arg(long, default_value_t = 5)]
        heartbeat_secs: u64,

        /// Total budget for engine health checks, in seconds
        #[arg(long, default_value_t = 600)]
        health_wait_secs: u64,
    },

    /// Check host prerequisites (Docker, GPU, disk, connectivity).
    Preflight {
        /// Server base URL to probe (optional)
        #[arg(long, env = "KITT_SERVER_URL", default_value = "")]
        server: String,

        /// Agent port to verify is free
        #[arg(long, default_value_t = 8090)]
        port: u16,

        /// Model storage directory for the disk space check
        #[arg(long, default_value = "")]
        model_dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Run {
            name,
            server,
            token,
            heartbeat_secs,
            health_wait_secs,
        } => {
            if token.is_empty() {
                bail!("an agent token is required (provision one on the server)");
            }
            let mut cfg = command_loop::AgentConfig::new(name, server, token);
            cfg.heartbeat_interval = Duration::from_secs(heartbeat_secs.max(1));
            cfg.health_wait = Duration::from_secs(health_wait_secs.max(1));
            command_loop::run(cfg).await
        }

        Commands::Preflight {
            server,
            port,
            model_dir,
        } => {
            let results = preflight::run_all_checks(&server, port, &model_dir).await;
            let ok = preflight::print_results(&results);
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
