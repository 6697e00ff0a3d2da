//! Cron scheduler — user-defined recurring and one-shot jobs.
//!
//! A single internal ticker at 1-second resolution scans all enabled jobs;
//! any job whose `next_run_at_ms` has passed is dispatched. Each job carries
//! a per-job atomic in-flight flag acquired by compare-and-swap before
//! dispatch and released in the executor's terminating step, so ticks
//! arriving during a long-running job never start a second execution.
//!
//! Post-execution: `Every` jobs reschedule to `now + interval`; `At` jobs
//! clear `next_run_at_ms` and disable themselves in the same persistence
//! unit. Removal during execution is safe — the trailing state update
//! gracefully no-ops when the id is gone.

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// When a job fires: `Every` repeats on a fixed interval, `At` fires once at
/// an absolute time and is auto-disabled afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    Every { every_ms: i64 },
    At { at_ms: i64 },
}

/// What the job does when it fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronPayload {
    /// The prompt routed through the agent.
    pub message: String,
    /// Whether the agent output is delivered to a chat.
    pub deliver: bool,
    /// Delivery channel; empty defaults to the creator's context.
    #[serde(default)]
    pub channel: String,
    /// Delivery chat id; empty defaults to the creator's context.
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronJobState {
    /// Next due time in unix millis; `None` for fired one-shot jobs.
    #[serde(default)]
    pub next_run_at_ms: Option<i64>,
    /// "ok" or "error" from the most recent run.
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    pub enabled: bool,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CronStore {
    version: u32,
    jobs: Vec<CronJob>,
}

impl Default for CronStore {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Failed to persist cron store: {0}")]
    Persist(String),
}

/// Async executor callback: runs the job's message through the agent and
/// returns the response text.
pub type CronHandler =
    Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

pub struct CronService {
    store_path: PathBuf,
    store: Mutex<CronStore>,
    /// Per-job in-flight flags, created lazily, acquired via CAS.
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
    /// Settable after construction: the executor is wired once the agent
    /// exists, but tools need the service first.
    handler: Mutex<Option<CronHandler>>,
    running: AtomicBool,
}

impl CronService {
    /// Open the service, loading any persisted jobs from `store_path`.
    pub fn new(store_path: impl Into<PathBuf>, handler: Option<CronHandler>) -> Arc<Self> {
        let store_path = store_path.into();
        let store = load_store(&store_path);
        Arc::new(Self {
            store_path,
            store: Mutex::new(store),
            in_flight: Mutex::new(HashMap::new()),
            handler: Mutex::new(handler),
            running: AtomicBool::new(false),
        })
    }

    /// Install the executor callback.
    pub fn set_handler(&self, handler: CronHandler) {
        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    /// Spawn the 1-second tick loop. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !service.running.load(Ordering::SeqCst) {
                    return;
                }
                service.check_jobs();
            }
        });
        info!("Cron service started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Create and persist a new job. Validates the schedule: `Every`
    /// intervals must be positive; `At` times may be in the past (they fire
    /// on the next tick and then auto-disable).
    pub fn add_job(
        &self,
        name: &str,
        schedule: CronSchedule,
        message: &str,
        deliver: bool,
        channel: &str,
        chat_id: &str,
    ) -> Result<CronJob, ScheduleError> {
        let now_ms = Utc::now().timestamp_millis();
        let next_run_at_ms = match schedule {
            CronSchedule::Every { every_ms } => {
                if every_ms <= 0 {
                    return Err(ScheduleError::InvalidSchedule(
                        "every interval must be positive".into(),
                    ));
                }
                Some(now_ms + every_ms)
            }
            CronSchedule::At { at_ms } => Some(at_ms),
        };

        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule,
            payload: CronPayload {
                message: message.to_string(),
                deliver,
                channel: channel.to_string(),
                chat_id: chat_id.to_string(),
            },
            enabled: true,
            state: CronJobState {
                next_run_at_ms,
                last_status: None,
                last_run_at_ms: None,
            },
            created_at_ms: now_ms,
        };

        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store.jobs.push(job.clone());
        persist_store(&self.store_path, &store)?;
        info!(job = %job.name, id = %job.id, "Added cron job");
        Ok(job)
    }

    /// Remove a job. Returns whether a job with that id existed.
    pub fn remove_job(&self, id: &str) -> bool {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        let before = store.jobs.len();
        store.jobs.retain(|j| j.id != id);
        let removed = store.jobs.len() < before;
        if removed {
            if let Err(e) = persist_store(&self.store_path, &store) {
                warn!(error = %e, "Failed to persist cron store after removal");
            }
            self.in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(id);
        }
        removed
    }

    /// Enable or disable a job. Returns the updated job, or `None` for an
    /// unknown id. Re-enabling an `At` job whose time has passed lets it fire
    /// on the next tick.
    pub fn enable_job(&self, id: &str, enabled: bool) -> Option<CronJob> {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        let job = store.jobs.iter_mut().find(|j| j.id == id)?;
        job.enabled = enabled;
        if enabled && job.state.next_run_at_ms.is_none() {
            job.state.next_run_at_ms = Some(match job.schedule {
                CronSchedule::Every { every_ms } => Utc::now().timestamp_millis() + every_ms,
                CronSchedule::At { at_ms } => at_ms,
            });
        }
        let updated = job.clone();
        if let Err(e) = persist_store(&self.store_path, &store) {
            warn!(error = %e, "Failed to persist cron store after enable/disable");
        }
        Some(updated)
    }

    /// List jobs; `include_disabled = false` filters to enabled ones.
    pub fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    /// Scan for due jobs and dispatch each on its own task. Public for the
    /// tick loop and for tests; callable any number of times without
    /// starting duplicate executions.
    pub fn check_jobs(self: &Arc<Self>) {
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<CronJob> = {
            let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
            store
                .jobs
                .iter()
                .filter(|j| {
                    j.enabled && j.state.next_run_at_ms.is_some_and(|next| next <= now_ms)
                })
                .cloned()
                .collect()
        };

        for job in due {
            let flag = self.in_flight_flag(&job.id);
            // CAS: skip when a previous execution is still running.
            if flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!(job = %job.name, "Skipping dispatch: previous run still in flight");
                continue;
            }

            let service = Arc::clone(self);
            tokio::spawn(async move {
                service.run_job(job, flag).await;
            });
        }
    }

    fn in_flight_flag(&self, id: &str) -> Arc<AtomicBool> {
        let mut flags = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            flags
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Execute one job against a local copy of its record, then apply the
    /// post-run state transition and release the in-flight flag.
    async fn run_job(self: &Arc<Self>, job: CronJob, flag: Arc<AtomicBool>) {
        debug!(job = %job.name, id = %job.id, "Executing cron job");

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let status = match handler {
            Some(handler) => match handler(job.clone()).await {
                Ok(_) => "ok",
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Cron job failed");
                    "error"
                }
            },
            None => "ok",
        };

        self.finish_job(&job, status);
        flag.store(false, Ordering::SeqCst);
    }

    /// Post-execution rescheduling, persisted in the same critical section
    /// as the enabled/next-run mutation. No-ops if the job was removed
    /// while running.
    fn finish_job(&self, job: &CronJob, status: &str) {
        let now_ms = Utc::now().timestamp_millis();
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());

        let Some(stored) = store.jobs.iter_mut().find(|j| j.id == job.id) else {
            debug!(job = %job.name, "Job removed during execution; skipping state update");
            return;
        };

        stored.state.last_status = Some(status.to_string());
        stored.state.last_run_at_ms = Some(now_ms);
        match stored.schedule {
            CronSchedule::Every { every_ms } => {
                stored.state.next_run_at_ms = Some(now_ms + every_ms);
            }
            CronSchedule::At { .. } => {
                stored.state.next_run_at_ms = None;
                stored.enabled = false;
            }
        }

        if let Err(e) = persist_store(&self.store_path, &store) {
            warn!(error = %e, "Failed to persist cron store after run");
        }
    }

    #[cfg(test)]
    fn force_due(&self, id: &str) {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(job) = store.jobs.iter_mut().find(|j| j.id == id) {
            job.state.next_run_at_ms = Some(Utc::now().timestamp_millis() - 1000);
        }
    }

    #[cfg(test)]
    fn job_by_id(&self, id: &str) -> Option<CronJob> {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store.jobs.iter().find(|j| j.id == id).cloned()
    }
}

fn load_store(path: &Path) -> CronStore {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cron store; starting empty");
                CronStore::default()
            }
        },
        Err(_) => CronStore::default(),
    }
}

fn persist_store(path: &Path, store: &CronStore) -> Result<(), ScheduleError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ScheduleError::Persist(e.to_string()))?;
    }
    let data =
        serde_json::to_vec_pretty(store).map_err(|e| ScheduleError::Persist(e.to_string()))?;
    std::fs::write(path, data).map_err(|e| ScheduleError::Persist(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn every(ms: i64) -> CronSchedule {
        CronSchedule::Every { every_ms: ms }
    }

    #[tokio::test]
    async fn add_and_list_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let cs = CronService::new(&path, None);
        let job = cs
            .add_job("test-job", every(60_000), "hello", true, "telegram", "123")
            .unwrap();

        assert_eq!(job.name, "test-job");
        assert!(job.enabled);
        assert_eq!(job.payload.message, "hello");
        assert!(job.state.next_run_at_ms.is_some());

        assert_eq!(cs.list_jobs(true).len(), 1);

        // Reload from disk to verify persistence.
        let cs2 = CronService::new(&path, None);
        assert_eq!(cs2.list_jobs(true).len(), 1);
    }

    #[tokio::test]
    async fn invalid_every_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cs = CronService::new(dir.path().join("jobs.json"), None);
        let err = cs
            .add_job("bad", every(0), "x", false, "", "")
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn remove_job() {
        let dir = tempfile::tempdir().unwrap();
        let cs = CronService::new(dir.path().join("jobs.json"), None);
        let job = cs
            .add_job("remove-me", every(60_000), "test", false, "", "")
            .unwrap();

        assert!(cs.remove_job(&job.id));
        assert!(cs.list_jobs(true).is_empty());
        assert!(!cs.remove_job("nonexistent"));
    }

    #[tokio::test]
    async fn enable_disable_job() {
        let dir = tempfile::tempdir().unwrap();
        let cs = CronService::new(dir.path().join("jobs.json"), None);
        let job = cs
            .add_job("toggle-me", every(60_000), "test", false, "", "")
            .unwrap();

        let disabled = cs.enable_job(&job.id, false).unwrap();
        assert!(!disabled.enabled);
        assert!(cs.list_jobs(false).is_empty());
        assert_eq!(cs.list_jobs(true).len(), 1);

        let reenabled = cs.enable_job(&job.id, true).unwrap();
        assert!(reenabled.enabled);
        assert!(cs.enable_job("nonexistent", true).is_none());
    }

    #[tokio::test]
    async fn at_schedule_disables_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        let handler: CronHandler = Arc::new(move |_job| {
            let fired = Arc::clone(&fired_clone);
            Box::pin(async move {
                fired.store(true, Ordering::SeqCst);
                Ok("done".to_string())
            })
        });

        let cs = CronService::new(dir.path().join("jobs.json"), Some(handler));
        let future_ms = Utc::now().timestamp_millis() + 3_600_000;
        let job = cs
            .add_job(
                "one-shot",
                CronSchedule::At { at_ms: future_ms },
                "do this once",
                false,
                "",
                "",
            )
            .unwrap();

        cs.force_due(&job.id);
        cs.check_jobs();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(fired.load(Ordering::SeqCst), "handler should have fired");
        let after = cs.job_by_id(&job.id).unwrap();
        assert!(!after.enabled, "at-job must auto-disable");
        assert!(after.state.next_run_at_ms.is_none());
        assert_eq!(after.state.last_status.as_deref(), Some("ok"));

        // A subsequent tick never re-fires it.
        fired.store(false, Ordering::SeqCst);
        cs.check_jobs();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn no_duplicate_execution_under_rapid_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);

        let handler: CronHandler = Arc::new(move |_job| {
            let count = Arc::clone(&count_clone);
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                // Simulate a slow handler (LLM call).
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok("done".to_string())
            })
        });

        let cs = CronService::new(dir.path().join("jobs.json"), Some(handler));
        let job = cs
            .add_job("no-dupe", every(60_000), "test", false, "", "")
            .unwrap();
        cs.force_due(&job.id);

        // Rapid ticks while the first execution is still running.
        cs.check_jobs();
        cs.check_jobs();
        cs.check_jobs();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "duplicate execution bug");
    }

    #[tokio::test]
    async fn every_schedule_reschedules_to_future() {
        let dir = tempfile::tempdir().unwrap();
        let handler: CronHandler =
            Arc::new(|_job| Box::pin(async { Ok("done".to_string()) }));

        let cs = CronService::new(dir.path().join("jobs.json"), Some(handler));
        let job = cs
            .add_job("recurring", every(5_000), "test", false, "", "")
            .unwrap();
        cs.force_due(&job.id);

        cs.check_jobs();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let after = cs.job_by_id(&job.id).unwrap();
        assert!(after.enabled);
        let next = after.state.next_run_at_ms.expect("must be rescheduled");
        assert!(next > Utc::now().timestamp_millis());
        // Within one tick of now + interval.
        assert!(next <= Utc::now().timestamp_millis() + 5_000 + 1_000);
    }

    #[tokio::test]
    async fn job_removed_during_execution_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Mutex::new(Some(started_tx));

        let handler: CronHandler = Arc::new(move |_job| {
            if let Some(tx) = started_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("done".to_string())
            })
        });

        let cs = CronService::new(dir.path().join("jobs.json"), Some(handler));
        let job = cs
            .add_job("will-be-removed", every(60_000), "test", false, "", "")
            .unwrap();
        cs.force_due(&job.id);

        cs.check_jobs();
        started_rx.await.unwrap();
        cs.remove_job(&job.id);

        // Let the execution finish; the trailing state update must no-op.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(cs.list_jobs(true).is_empty());
    }

    #[tokio::test]
    async fn store_file_created_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("jobs.json");

        let cs = CronService::new(&path, None);
        cs.add_job("test", every(60_000), "msg", false, "", "")
            .unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn schedule_serde_tagged_union() {
        let s = every(1000);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"kind\":\"every\""));
        let back: CronSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);

        let at: CronSchedule = serde_json::from_str(r#"{"kind":"at","at_ms":123}"#).unwrap();
        assert_eq!(at, CronSchedule::At { at_ms: 123 });
    }

    #[tokio::test]
    async fn past_at_time_allowed_and_fires_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let handler: CronHandler = Arc::new(move |_job| {
            let fired = Arc::clone(&fired_clone);
            Box::pin(async move {
                fired.store(true, Ordering::SeqCst);
                Ok(String::new())
            })
        });

        let cs = CronService::new(dir.path().join("jobs.json"), Some(handler));
        let past_ms = Utc::now().timestamp_millis() - 1_000;
        cs.add_job(
            "late",
            CronSchedule::At { at_ms: past_ms },
            "overdue",
            false,
            "",
            "",
        )
        .unwrap();

        cs.check_jobs();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
