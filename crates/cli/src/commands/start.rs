//! `mclaw start` — run the full assistant until SIGINT/SIGTERM.

use super::runtime;
use mclaw_channels::{ChannelRegistry, TelegramChannel};
use mclaw_config::Config;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub async fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load_from(config_path)?;
    let rt = runtime::build(cfg).await?;

    // Transports.
    let mut channels = ChannelRegistry::new();
    if rt.cfg.channels.telegram.enabled {
        channels.register(Arc::new(TelegramChannel::new(
            rt.cfg.channels.telegram.token.clone(),
            rt.cfg.channels.telegram.allow_from.clone(),
            Arc::clone(&rt.bus),
        )));
    }
    if channels.is_empty() {
        info!("No channels enabled; agent reachable via `mclaw agent` sessions only");
    }
    channels.start_all().await?;

    let channels = Arc::new(channels);
    let dispatcher = tokio::spawn(
        Arc::clone(&channels).dispatch_outbound(Arc::clone(&rt.bus)),
    );

    // Schedulers.
    rt.cron.start();
    if rt.cfg.heartbeat.enabled {
        if let Err(e) = rt.heartbeat.start() {
            tracing::warn!(error = %e, "Heartbeat not started");
        }
    }

    // The agent loop consumer.
    let agent = Arc::clone(&rt.agent);
    let agent_task = tokio::spawn(agent.run());

    info!(
        model = %rt.switcher.current_model(),
        workspace = %rt.cfg.workspace_path().display(),
        "mclaw started — press Ctrl-C to stop"
    );

    wait_for_shutdown().await;
    info!("Shutting down");

    rt.agent.stop();
    rt.cron.stop();
    rt.heartbeat.stop();
    channels.stop_all().await;
    dispatcher.abort();
    agent_task.abort();

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
