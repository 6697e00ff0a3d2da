//! `mclaw cron` — manage scheduled jobs from the command line.

use chrono::{DateTime, Local, TimeZone, Utc};
use clap::Subcommand;
use mclaw_config::Config;
use mclaw_scheduler::{CronSchedule, CronService};
use std::path::Path;

#[derive(Subcommand)]
pub enum CronAction {
    /// List all jobs (including disabled ones)
    List,

    /// Add a new job
    Add {
        /// Job name
        name: String,
        /// The prompt the agent runs when the job fires
        message: String,
        /// Recurring interval in seconds (mutually exclusive with --at)
        #[arg(long)]
        every: Option<i64>,
        /// One-shot ISO 8601 time, e.g. 2026-09-14T09:00:00+07:00
        #[arg(long)]
        at: Option<String>,
        /// Deliver the result to a channel chat
        #[arg(long)]
        deliver: bool,
        /// Delivery channel (e.g. telegram)
        #[arg(long, default_value = "")]
        channel: String,
        /// Delivery chat id
        #[arg(long, default_value = "")]
        to: String,
    },

    /// Remove a job by id
    Remove { job_id: String },

    /// Enable a job by id
    Enable { job_id: String },

    /// Disable a job by id
    Disable { job_id: String },
}

pub fn run(config_path: &Path, action: CronAction) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load_from(config_path)?;
    let service = CronService::new(cfg.data_dir().join("cron").join("jobs.json"), None);

    match action {
        CronAction::List => {
            let jobs = service.list_jobs(true);
            if jobs.is_empty() {
                println!("No scheduled jobs.");
                return Ok(());
            }
            for job in jobs {
                let schedule = match job.schedule {
                    CronSchedule::Every { every_ms } => format!("every {}s", every_ms / 1000),
                    CronSchedule::At { at_ms } => format!("at {}", format_ms(at_ms)),
                };
                let next = job
                    .state
                    .next_run_at_ms
                    .map(format_ms)
                    .unwrap_or_else(|| "not scheduled".into());
                println!(
                    "{} [{}] {} — {} (next: {}) deliver={}",
                    job.id,
                    if job.enabled { "on " } else { "off" },
                    job.name,
                    schedule,
                    next,
                    job.payload.deliver,
                );
            }
        }

        CronAction::Add {
            name,
            message,
            every,
            at,
            deliver,
            channel,
            to,
        } => {
            let schedule = match (every, at) {
                (Some(seconds), None) => CronSchedule::Every {
                    every_ms: seconds * 1000,
                },
                (None, Some(iso)) => {
                    let dt = DateTime::parse_from_rfc3339(&iso)
                        .map_err(|e| format!("invalid --at time: {e}"))?;
                    CronSchedule::At {
                        at_ms: dt.timestamp_millis(),
                    }
                }
                _ => return Err("exactly one of --every or --at is required".into()),
            };

            let job = service.add_job(&name, schedule, &message, deliver, &channel, &to)?;
            println!("Created job {} ({})", job.name, job.id);
        }

        CronAction::Remove { job_id } => {
            if service.remove_job(&job_id) {
                println!("Removed job {job_id}");
            } else {
                println!("Job {job_id} not found");
            }
        }

        CronAction::Enable { job_id } => match service.enable_job(&job_id, true) {
            Some(job) => println!("Enabled job {}", job.name),
            None => println!("Job {job_id} not found"),
        },

        CronAction::Disable { job_id } => match service.enable_job(&job_id, false) {
            Some(job) => println!("Disabled job {}", job.name),
            None => println!("Job {job_id} not found"),
        },
    }

    Ok(())
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
