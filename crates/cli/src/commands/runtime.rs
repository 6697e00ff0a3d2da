//! Shared runtime assembly: the constructor wiring used by both `start` and
//! `agent`. Every process-wide component is created once here and passed
//! explicitly; there are no hidden globals.

use mclaw_agent::{AgentLoop, ModelSwitcher};
use mclaw_config::Config;
use mclaw_core::{MessageBus, OutboundMessage, ToolRegistry};
use mclaw_heartbeat::{HeartbeatHandler, HeartbeatService};
use mclaw_memory::{MemoryEngine, ProviderFn};
use mclaw_scheduler::{CronHandler, CronService};
use mclaw_session::SessionManager;
use mclaw_tools::{
    BrowserTool, CronTool, DeliveryContext, ExecTool, HeartbeatTool, ListDirTool, ReadFileTool,
    WebFetchTool, WebSearchTool, WriteFileTool,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct Runtime {
    pub cfg: Config,
    pub bus: Arc<MessageBus>,
    pub switcher: Arc<ModelSwitcher>,
    pub agent: Arc<AgentLoop>,
    pub cron: Arc<CronService>,
    pub heartbeat: Arc<HeartbeatService>,
}

/// Build the full runtime graph from configuration.
pub async fn build(cfg: Config) -> Result<Runtime, Box<dyn std::error::Error>> {
    let workspace = cfg.workspace_path();
    std::fs::create_dir_all(&workspace)?;
    let data_dir = cfg.data_dir();

    let bus = Arc::new(MessageBus::new());
    let sessions = Arc::new(SessionManager::new(data_dir.join("sessions")));

    let provider = mclaw_providers::create_provider(&cfg)?;
    let switcher = Arc::new(ModelSwitcher::new(&cfg, provider));

    // Memory extraction/consolidation follow the switcher's current model.
    let provider_fn: ProviderFn = {
        let switcher = Arc::clone(&switcher);
        Arc::new(move || (switcher.current_provider(), switcher.current_model()))
    };
    let memory = match MemoryEngine::from_config(&cfg, provider_fn).await {
        Ok(engine) => engine,
        Err(e) => {
            warn!(error = %e, "Failed to initialize memory engine; continuing without memory");
            None
        }
    };

    let cron = CronService::new(data_dir.join("cron").join("jobs.json"), None);
    let heartbeat = HeartbeatService::new(
        &workspace,
        None,
        Duration::from_secs(cfg.heartbeat.interval_seconds),
        cfg.heartbeat.enabled,
    );
    let delivery_context = DeliveryContext::new();

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(ListDirTool));
    registry.register(Arc::new(ExecTool::new(&workspace)));
    registry.register(Arc::new(WebSearchTool::new(
        cfg.tools.web.search.api_key.clone(),
        cfg.tools.web.search.max_results,
    )));
    registry.register(Arc::new(WebFetchTool::new(50_000)));
    registry.register(Arc::new(BrowserTool::new(Duration::from_secs(30))));
    registry.register(Arc::new(CronTool::new(
        Arc::clone(&cron),
        Arc::clone(&delivery_context),
    )));
    registry.register(Arc::new(HeartbeatTool::new(Arc::clone(&heartbeat))));

    let agent = AgentLoop::new(
        &cfg,
        Arc::clone(&bus),
        Arc::clone(&switcher),
        Arc::clone(&sessions),
        Arc::new(registry),
        memory,
        Some(delivery_context),
    );

    // Cron executor: run the job prompt through the agent, deliver when
    // requested.
    let cron_handler: CronHandler = {
        let agent = Arc::clone(&agent);
        let bus = Arc::clone(&bus);
        Arc::new(move |job| {
            let agent = Arc::clone(&agent);
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                let session_key = format!("cron:{}", job.id);
                let response = agent
                    .process_direct(&job.payload.message, &session_key)
                    .await
                    .map_err(|e| e.to_string())?;
                if job.payload.deliver && !job.payload.channel.is_empty() && !response.is_empty() {
                    bus.publish_outbound(OutboundMessage {
                        channel: job.payload.channel.clone(),
                        chat_id: job.payload.chat_id.clone(),
                        content: response.clone(),
                    });
                }
                Ok(response)
            })
        })
    };
    cron.set_handler(cron_handler);

    // Heartbeat callback: same agent path as cron, fixed session.
    let heartbeat_handler: HeartbeatHandler = {
        let agent = Arc::clone(&agent);
        Arc::new(move |prompt| {
            let agent = Arc::clone(&agent);
            Box::pin(async move {
                agent
                    .process_direct(&prompt, "heartbeat:main")
                    .await
                    .map_err(|e| e.to_string())
            })
        })
    };
    heartbeat.set_handler(heartbeat_handler);

    Ok(Runtime {
        cfg,
        bus,
        switcher,
        agent,
        cron,
        heartbeat,
    })
}
