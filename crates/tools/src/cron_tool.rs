//! Cron CRUD surface exposed to the model.

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use mclaw_core::error::ToolError;
use mclaw_core::tool::Tool;
use mclaw_scheduler::{CronJob, CronSchedule, CronService};
use std::sync::{Arc, Mutex};

/// Per-message delivery context, injected by the agent loop before each turn
/// so `deliver` defaults to the chat that asked for the job.
#[derive(Default)]
pub struct DeliveryContext {
    inner: Mutex<(String, String)>,
}

impl DeliveryContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, channel: &str, chat_id: &str) {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) =
            (channel.to_string(), chat_id.to_string());
    }

    pub fn get(&self) -> (String, String) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

pub struct CronTool {
    service: Arc<CronService>,
    context: Arc<DeliveryContext>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>, context: Arc<DeliveryContext>) -> Self {
        Self { service, context }
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> String {
        r#"Manage scheduled/recurring tasks (cron jobs). Actions:
- "add": Create a new scheduled job. Requires: name, message, schedule_type ("every" or "at"), interval_seconds (for "every") or run_at_iso (for "at"). Optional: deliver (bool), channel, to (chat_id).
- "list": List all active scheduled jobs.
- "remove": Remove a job by ID. Requires: job_id.
- "enable": Enable a disabled job. Requires: job_id.
- "disable": Disable a job. Requires: job_id.
When deliver=true, the job result will be sent to the specified channel/chat."#
            .into()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "description": "Action to perform: add, list, remove, enable, disable",
                    "enum": ["add", "list", "remove", "enable", "disable"]
                },
                "name": { "type": "string", "description": "Job name (required for add)" },
                "message": {
                    "type": "string",
                    "description": "The prompt/message the agent will process when the job runs (required for add)"
                },
                "schedule_type": {
                    "type": "string",
                    "description": "Schedule type: 'every' for recurring, 'at' for one-time",
                    "enum": ["every", "at"]
                },
                "interval_seconds": {
                    "type": "number",
                    "description": "Interval in seconds for 'every' schedule type (e.g. 3600 = 1 hour)"
                },
                "run_at_iso": {
                    "type": "string",
                    "description": "ISO 8601 datetime for 'at' schedule type (e.g. '2026-09-14T09:00:00+07:00')"
                },
                "deliver": {
                    "type": "boolean",
                    "description": "Whether to deliver the result to a chat channel (default: true)"
                },
                "channel": { "type": "string", "description": "Target channel for delivery (e.g. 'telegram')" },
                "to": { "type": "string", "description": "Target chat/user ID for delivery" },
                "job_id": { "type": "string", "description": "Job ID (required for remove/enable/disable)" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        match args["action"].as_str().unwrap_or("") {
            "add" => self.add_job(&args),
            "list" => Ok(self.list_jobs()),
            "remove" => Ok(self.remove_job(&args)),
            "enable" => Ok(self.toggle_job(&args, true)),
            "disable" => Ok(self.toggle_job(&args, false)),
            other => Ok(format!(
                "Unknown action: {other}. Use: add, list, remove, enable, disable"
            )),
        }
    }
}

impl CronTool {
    fn add_job(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        let name = args["name"].as_str().unwrap_or("");
        let message = args["message"].as_str().unwrap_or("");
        if name.is_empty() {
            return Ok("Error: 'name' is required for add".into());
        }
        if message.is_empty() {
            return Ok("Error: 'message' is required for add".into());
        }

        let deliver = args["deliver"].as_bool().unwrap_or(true);
        let (default_channel, default_chat) = self.context.get();
        let channel = args["channel"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(String::from)
            .unwrap_or(default_channel);
        let to = args["to"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(String::from)
            .unwrap_or(default_chat);

        let schedule = match args["schedule_type"].as_str().unwrap_or("") {
            "every" => {
                let interval = args["interval_seconds"].as_f64().unwrap_or(0.0);
                if interval <= 0.0 {
                    return Ok(
                        "Error: 'interval_seconds' must be a positive number for 'every' schedule"
                            .into(),
                    );
                }
                CronSchedule::Every {
                    every_ms: (interval as i64) * 1000,
                }
            }
            "at" => {
                let run_at_iso = args["run_at_iso"].as_str().unwrap_or("");
                if run_at_iso.is_empty() {
                    return Ok("Error: 'run_at_iso' is required for 'at' schedule".into());
                }
                match DateTime::parse_from_rfc3339(run_at_iso) {
                    Ok(dt) => CronSchedule::At {
                        at_ms: dt.timestamp_millis(),
                    },
                    Err(e) => {
                        return Ok(format!(
                            "Error: invalid run_at_iso format: {e}. Use ISO 8601 like '2026-09-14T09:00:00+07:00'"
                        ))
                    }
                }
            }
            _ => return Ok("Error: 'schedule_type' must be 'every' or 'at'".into()),
        };

        match self
            .service
            .add_job(name, schedule, message, deliver, &channel, &to)
        {
            Ok(job) => Ok(format!(
                "Created cron job '{}' (ID: {})\n  Next run: {}\n  Message: {}\n  Deliver: {}",
                job.name,
                job.id,
                format_next_run(&job),
                job.payload.message,
                job.payload.deliver
            )),
            Err(e) => Ok(format!("Error adding job: {e}")),
        }
    }

    fn list_jobs(&self) -> String {
        let jobs = self.service.list_jobs(true);
        if jobs.is_empty() {
            return "No scheduled jobs.".into();
        }

        let rendered: Vec<serde_json::Value> = jobs
            .iter()
            .map(|job| {
                serde_json::json!({
                    "id": job.id,
                    "name": job.name,
                    "enabled": job.enabled,
                    "schedule": format_schedule(&job.schedule),
                    "next_run": format_next_run(job),
                    "message": job.payload.message,
                    "deliver": job.payload.deliver,
                })
            })
            .collect();

        format!(
            "Scheduled jobs ({}):\n{}",
            rendered.len(),
            serde_json::to_string_pretty(&rendered).unwrap_or_default()
        )
    }

    fn remove_job(&self, args: &serde_json::Value) -> String {
        let job_id = args["job_id"].as_str().unwrap_or("");
        if job_id.is_empty() {
            return "Error: 'job_id' is required for remove".into();
        }
        if self.service.remove_job(job_id) {
            format!("Removed job {job_id}")
        } else {
            format!("Job {job_id} not found")
        }
    }

    fn toggle_job(&self, args: &serde_json::Value, enable: bool) -> String {
        let job_id = args["job_id"].as_str().unwrap_or("");
        if job_id.is_empty() {
            return "Error: 'job_id' is required".into();
        }
        match self.service.enable_job(job_id, enable) {
            Some(job) => format!(
                "Job '{}' {}",
                job.name,
                if enable { "enabled" } else { "disabled" }
            ),
            None => format!("Job {job_id} not found"),
        }
    }
}

fn format_schedule(schedule: &CronSchedule) -> String {
    match schedule {
        CronSchedule::Every { every_ms } => format!("every {}s", every_ms / 1000),
        CronSchedule::At { at_ms } => format!("at {}", format_ms(*at_ms)),
    }
}

fn format_next_run(job: &CronJob) -> String {
    match job.state.next_run_at_ms {
        Some(ms) => format_ms(ms),
        None => "not scheduled".into(),
    }
}

fn format_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        _ => "invalid time".into(),
    }
}
