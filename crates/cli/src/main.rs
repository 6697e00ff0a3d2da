//! MClaw CLI — the main entry point.
//!
//! Commands:
//! - `start`   — run the full assistant (channels + cron + heartbeat)
//! - `agent`   — interactive chat or single-message mode
//! - `status`  — show configuration and store status
//! - `cron`    — manage scheduled jobs
//! - `skills`  — manage installed skills
//! - `version` — show version information

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "mclaw", about = "MClaw — Personal AI Assistant", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (default: ~/.mclaw/config.json)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mclaw server (all channels + cron + heartbeat)
    Start,

    /// Interact with the agent directly
    Agent {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show mclaw status
    Status,

    /// Manage scheduled tasks
    Cron {
        #[command(subcommand)]
        action: commands::cron::CronAction,
    },

    /// Manage skills (install, list, remove)
    Skills {
        #[command(subcommand)]
        action: commands::skills::SkillsAction,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(mclaw_config::Config::default_path);

    match cli.command {
        Commands::Start => commands::start::run(&config_path).await?,
        Commands::Agent { message } => commands::agent::run(&config_path, message).await?,
        Commands::Status => commands::status::run(&config_path).await?,
        Commands::Cron { action } => commands::cron::run(&config_path, action)?,
        Commands::Skills { action } => commands::skills::run(&config_path, action)?,
        Commands::Version => {
            println!("mclaw v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
