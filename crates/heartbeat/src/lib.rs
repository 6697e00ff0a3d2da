//! Heartbeat — periodic self-triggered prompts built from curated notes.
//!
//! A single global ticker (default 10 minutes) renders every enabled note
//! into one prompt and dispatches it through the same agent callback used by
//! cron. An atomic "processing" flag guards against overlap: when a prior
//! heartbeat is still running, the new tick is skipped and logged.

use chrono::{Local, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An individual heartbeat item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatNote {
    pub id: String,
    pub content: String,
    /// reminder, task, note, instruction
    pub category: String,
    pub enabled: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatStore {
    version: u32,
    notes: Vec<HeartbeatNote>,
}

impl Default for HeartbeatStore {
    fn default() -> Self {
        Self {
            version: 1,
            notes: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Failed to persist heartbeat store: {0}")]
    Persist(String),
}

/// Async callback receiving the heartbeat prompt.
pub type HeartbeatHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

pub struct HeartbeatService {
    workspace: PathBuf,
    store_path: PathBuf,
    store: Mutex<HeartbeatStore>,
    /// Settable after construction: the callback is wired once the agent
    /// exists, but tools need the service first.
    handler: Mutex<Option<HeartbeatHandler>>,
    interval: Duration,
    enabled: bool,
    running: AtomicBool,
    processing: AtomicBool,
}

impl HeartbeatService {
    /// Open the service. On first boot, a legacy free-text
    /// `<workspace>/memory/HEARTBEAT.md` is migrated into a single
    /// `category=migrated` note.
    pub fn new(
        workspace: impl Into<PathBuf>,
        handler: Option<HeartbeatHandler>,
        interval: Duration,
        enabled: bool,
    ) -> Arc<Self> {
        let workspace = workspace.into();
        let store_path = workspace.join("memory").join("heartbeat_notes.json");

        let store = match std::fs::read_to_string(&store_path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(error = %e, "Corrupt heartbeat store; starting empty");
                HeartbeatStore::default()
            }),
            Err(_) => {
                let mut store = HeartbeatStore::default();
                migrate_legacy_file(&workspace, &mut store, &store_path);
                store
            }
        };

        Arc::new(Self {
            workspace,
            store_path,
            store: Mutex::new(store),
            handler: Mutex::new(handler),
            interval,
            enabled,
            running: AtomicBool::new(false),
            processing: AtomicBool::new(false),
        })
    }

    /// Install the heartbeat callback.
    pub fn set_handler(&self, handler: HeartbeatHandler) {
        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    /// Spawn the tick loop. Returns immediately; errors when disabled.
    pub fn start(self: &Arc<Self>) -> Result<(), String> {
        if !self.enabled {
            return Err("heartbeat service is disabled".into());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; skip it so the
            // first heartbeat lands one full interval after start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !service.running.load(Ordering::SeqCst) {
                    return;
                }
                service.check_heartbeat().await;
            }
        });

        info!(interval_secs = self.interval.as_secs(), "Heartbeat service started");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one heartbeat: build the prompt and dispatch it. Skips (and logs)
    /// when a previous heartbeat is still processing.
    pub async fn check_heartbeat(&self) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Skipping heartbeat: previous heartbeat still processing");
            return;
        }

        let prompt = self.build_prompt();
        debug!("Running heartbeat check");

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = handler {
            match handler(prompt).await {
                Ok(_) => {
                    self.append_log("Heartbeat completed successfully");
                }
                Err(e) => {
                    self.append_log(&format!("Heartbeat error: {e}"));
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        }

        self.processing.store(false, Ordering::SeqCst);
    }

    /// Render the current timestamp plus all enabled notes into one prompt.
    pub fn build_prompt(&self) -> String {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());

        let mut notes_list = String::new();
        let mut enabled_count = 0;
        for note in store.notes.iter().filter(|n| n.enabled) {
            enabled_count += 1;
            notes_list.push_str(&format!("- [{}] {}\n", note.category, note.content));
        }
        if enabled_count == 0 {
            notes_list = "(no active notes)".into();
        }

        format!(
            "# Heartbeat Check\n\nCurrent time: {}\nActive notes ({}):\n\n{}\n\nCheck if there are any tasks you should act on based on the notes above.\nBe proactive in identifying potential issues or improvements.\n",
            Local::now().format("%Y-%m-%d %H:%M"),
            enabled_count,
            notes_list
        )
    }

    // --- CRUD ---

    pub fn add_note(&self, content: &str, category: &str) -> Result<HeartbeatNote, HeartbeatError> {
        let category = if category.is_empty() { "note" } else { category };
        let note = HeartbeatNote {
            id: format!("{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            content: content.to_string(),
            category: category.to_string(),
            enabled: true,
            created_at_ms: Utc::now().timestamp_millis(),
        };

        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store.notes.push(note.clone());
        persist_store(&self.store_path, &store)?;
        Ok(note)
    }

    pub fn remove_note(&self, note_id: &str) -> bool {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        let before = store.notes.len();
        store.notes.retain(|n| n.id != note_id);
        let removed = store.notes.len() < before;
        if removed {
            if let Err(e) = persist_store(&self.store_path, &store) {
                warn!(error = %e, "Failed to persist heartbeat store after removal");
            }
        }
        removed
    }

    pub fn enable_note(&self, note_id: &str, enabled: bool) -> Option<HeartbeatNote> {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        let note = store.notes.iter_mut().find(|n| n.id == note_id)?;
        note.enabled = enabled;
        let updated = note.clone();
        if let Err(e) = persist_store(&self.store_path, &store) {
            warn!(error = %e, "Failed to persist heartbeat store after enable/disable");
        }
        Some(updated)
    }

    pub fn list_notes(&self, include_disabled: bool) -> Vec<HeartbeatNote> {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store
            .notes
            .iter()
            .filter(|n| include_disabled || n.enabled)
            .cloned()
            .collect()
    }

    fn append_log(&self, message: &str) {
        let log_path = self.workspace.join("memory").join("heartbeat.log");
        if let Some(dir) = log_path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
        {
            let _ = writeln!(
                file,
                "[{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                message
            );
        }
    }
}

fn migrate_legacy_file(workspace: &Path, store: &mut HeartbeatStore, store_path: &Path) {
    let legacy = workspace.join("memory").join("HEARTBEAT.md");
    let Ok(content) = std::fs::read_to_string(&legacy) else {
        return;
    };
    if content.is_empty() {
        return;
    }

    store.notes.push(HeartbeatNote {
        id: format!("{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
        content,
        category: "migrated".into(),
        enabled: true,
        created_at_ms: Utc::now().timestamp_millis(),
    });

    if persist_store(store_path, store).is_ok() {
        info!("Migrated HEARTBEAT.md content to notes store");
    }
}

fn persist_store(path: &Path, store: &HeartbeatStore) -> Result<(), HeartbeatError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| HeartbeatError::Persist(e.to_string()))?;
    }
    let data =
        serde_json::to_vec_pretty(store).map_err(|e| HeartbeatError::Persist(e.to_string()))?;
    std::fs::write(path, data).map_err(|e| HeartbeatError::Persist(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn service(dir: &Path, handler: Option<HeartbeatHandler>) -> Arc<HeartbeatService> {
        HeartbeatService::new(dir, handler, Duration::from_millis(100), true)
    }

    #[tokio::test]
    async fn add_list_remove_notes() {
        let tmp = tempfile::tempdir().unwrap();
        let hs = service(tmp.path(), None);

        let note = hs.add_note("water the plants", "reminder").unwrap();
        assert_eq!(note.category, "reminder");
        assert!(note.enabled);

        assert_eq!(hs.list_notes(true).len(), 1);
        assert!(hs.remove_note(&note.id));
        assert!(hs.list_notes(true).is_empty());
        assert!(!hs.remove_note("nonexistent"));
    }

    #[tokio::test]
    async fn default_category_is_note() {
        let tmp = tempfile::tempdir().unwrap();
        let hs = service(tmp.path(), None);
        let note = hs.add_note("something", "").unwrap();
        assert_eq!(note.category, "note");
    }

    #[tokio::test]
    async fn enable_disable_filters_list() {
        let tmp = tempfile::tempdir().unwrap();
        let hs = service(tmp.path(), None);
        let note = hs.add_note("check CI", "task").unwrap();

        let disabled = hs.enable_note(&note.id, false).unwrap();
        assert!(!disabled.enabled);
        assert!(hs.list_notes(false).is_empty());
        assert_eq!(hs.list_notes(true).len(), 1);

        assert!(hs.enable_note(&note.id, true).unwrap().enabled);
        assert!(hs.enable_note("nope", true).is_none());
    }

    #[tokio::test]
    async fn notes_persist_across_restart() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let hs = service(tmp.path(), None);
            hs.add_note("persisted", "note").unwrap();
        }
        let hs2 = service(tmp.path(), None);
        let notes = hs2.list_notes(true);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].content, "persisted");
    }

    #[tokio::test]
    async fn prompt_renders_enabled_notes() {
        let tmp = tempfile::tempdir().unwrap();
        let hs = service(tmp.path(), None);
        hs.add_note("water the plants", "reminder").unwrap();
        let disabled = hs.add_note("old task", "task").unwrap();
        let _ = hs.enable_note(&disabled.id, false);

        let prompt = hs.build_prompt();
        assert!(prompt.contains("# Heartbeat Check"));
        assert!(prompt.contains("- [reminder] water the plants"));
        assert!(!prompt.contains("old task"));
        assert!(prompt.contains("Active notes (1)"));
    }

    #[tokio::test]
    async fn prompt_placeholder_when_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let hs = service(tmp.path(), None);
        assert!(hs.build_prompt().contains("(no active notes)"));
    }

    #[tokio::test]
    async fn overlap_guard_caps_concurrency_at_one() {
        // Interval 100ms, handler sleeps 300ms, run ~800ms:
        // concurrent in-flight handlers must never exceed 1.
        let tmp = tempfile::tempdir().unwrap();

        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let runs = Arc::new(AtomicU32::new(0));

        let (in_flight_c, max_seen_c, runs_c) =
            (Arc::clone(&in_flight), Arc::clone(&max_seen), Arc::clone(&runs));
        let handler: HeartbeatHandler = Arc::new(move |_prompt| {
            let in_flight = Arc::clone(&in_flight_c);
            let max_seen = Arc::clone(&max_seen_c);
            let runs = Arc::clone(&runs_c);
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(String::new())
            })
        });

        let hs = service(tmp.path(), Some(handler));
        hs.start().unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        hs.stop();

        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "overlapping heartbeats");
    }

    #[tokio::test]
    async fn disabled_service_refuses_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let hs = HeartbeatService::new(tmp.path(), None, Duration::from_secs(1), false);
        assert!(hs.start().is_err());
        assert!(!hs.is_running());
    }

    #[tokio::test]
    async fn legacy_file_migrated_once() {
        let tmp = tempfile::tempdir().unwrap();
        let memory_dir = tmp.path().join("memory");
        std::fs::create_dir_all(&memory_dir).unwrap();
        std::fs::write(memory_dir.join("HEARTBEAT.md"), "- old freeform note\n").unwrap();

        let hs = service(tmp.path(), None);
        let notes = hs.list_notes(true);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].category, "migrated");
        assert!(notes[0].content.contains("old freeform note"));

        // Second boot: store exists, no duplicate migration.
        let hs2 = service(tmp.path(), None);
        assert_eq!(hs2.list_notes(true).len(), 1);
    }

    #[tokio::test]
    async fn handler_error_logged_and_flag_released() {
        let tmp = tempfile::tempdir().unwrap();
        let handler: HeartbeatHandler =
            Arc::new(|_prompt| Box::pin(async { Err("boom".to_string()) }));
        let hs = service(tmp.path(), Some(handler));

        hs.check_heartbeat().await;
        // Flag released: a second run proceeds (would be skipped otherwise).
        hs.check_heartbeat().await;

        let log = std::fs::read_to_string(tmp.path().join("memory").join("heartbeat.log")).unwrap();
        assert!(log.contains("Heartbeat error: boom"));
        assert_eq!(log.lines().count(), 2);
    }
}
