use clap::{Parser, Subcommand};

mod client;
mod commands;

#[derive(Parser)]
#[command(name = "kitt")]
#[command(about = "KITT - distributed LLM inference benchmarking", long_about = None)]
#[command(version)]
struct Cli {
    /// Server base URL
    #[arg(long, env = "KITT_SERVER_URL", default_value = "http://127.0.0.1:8088")]
    server: String,

    /// Operator token
    #[arg(long, env = "KITT_ADMIN_TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Agent commands
    Agents {
        #[command(subcommand)]
        cmd: AgentsCmd,
    },

    /// Campaign commands
    Campaign {
        #[command(subcommand)]
        cmd: CampaignCmd,
    },

    /// Ledger database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },
}

#[derive(Subcommand)]
enum AgentsCmd {
    /// List registered agents and their liveness
    List,
}

#[derive(Subcommand)]
enum CampaignCmd {
    /// Create and start a campaign from a YAML file
    Run {
        /// Campaign config file
        file: String,

        /// Target agent name (overrides any agent in the file)
        #[arg(long)]
        agent: String,

        /// Poll until the campaign settles
        #[arg(long)]
        watch: bool,

        /// Give up watching after this many seconds (0 = no limit)
        #[arg(long, default_value_t = 0)]
        watch_timeout_secs: u64,
    },

    /// Show campaign status (latest when no id is given)
    Status {
        campaign_id: Option<String>,
    },

    /// Request cancellation of a campaign
    Cancel {
        campaign_id: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Connectivity + schema version
    Status,
    /// Apply pending migrations
    Migrate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let api = client::Api::new(&cli.server, &cli.token);

    let result = match cli.cmd {
        Commands::Agents { cmd } => match cmd {
            AgentsCmd::List => commands::agents::list(&api).await,
        },
        Commands::Campaign { cmd } => match cmd {
            CampaignCmd::Run {
                file,
                agent,
                watch,
                watch_timeout_secs,
            } => commands::campaign::run(&api, &file, &agent, watch, watch_timeout_secs).await,
            CampaignCmd::Status { campaign_id } => {
                commands::campaign::status(&api, campaign_id.as_deref()).await
            }
            CampaignCmd::Cancel { campaign_id } => {
                commands::campaign::cancel(&api, &campaign_id).await
            }
        },
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => commands::db::status().await,
            DbCmd::Migrate => commands::db::migrate().await,
        },
    };

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e.message);
            std::process::exit(e.exit_code());
        }
    }
}
