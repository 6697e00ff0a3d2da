//! `mclaw status` — show configuration and store status.

use mclaw_config::Config;
use mclaw_heartbeat::HeartbeatService;
use mclaw_scheduler::CronService;
use std::path::Path;
use std::time::Duration;

pub async fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load_from(config_path)?;
    let workspace = cfg.workspace_path();
    let data_dir = cfg.data_dir();

    println!("mclaw v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Config:    {}", config_path.display());
    println!("Workspace: {}", workspace.display());
    println!("Model:     {}", cfg.agents.defaults.model);
    if !cfg.agents.defaults.fallback_models.is_empty() {
        println!("Fallbacks: {}", cfg.agents.defaults.fallback_models.join(", "));
    }
    println!();

    println!("Channels:");
    println!(
        "  telegram: {}",
        if cfg.channels.telegram.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  discord:  {}",
        if cfg.channels.discord.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  whatsapp: {}",
        if cfg.channels.whatsapp.enabled { "enabled" } else { "disabled" }
    );
    println!();

    println!(
        "Memory:    {}",
        if cfg.memory.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "Heartbeat: {} (every {}s)",
        if cfg.heartbeat.enabled { "enabled" } else { "disabled" },
        cfg.heartbeat.interval_seconds
    );

    let cron = CronService::new(data_dir.join("cron").join("jobs.json"), None);
    let jobs = cron.list_jobs(true);
    let enabled_jobs = jobs.iter().filter(|j| j.enabled).count();
    println!("Cron jobs: {} ({} enabled)", jobs.len(), enabled_jobs);

    let heartbeat = HeartbeatService::new(&workspace, None, Duration::from_secs(600), false);
    let notes = heartbeat.list_notes(true);
    let enabled_notes = notes.iter().filter(|n| n.enabled).count();
    println!("Notes:     {} ({} enabled)", notes.len(), enabled_notes);

    let sessions = mclaw_session::SessionManager::new(data_dir.join("sessions"));
    println!("Sessions:  {}", sessions.list_keys().len());

    Ok(())
}
