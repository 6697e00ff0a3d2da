//! Session management — per-conversation history and running summary.
//!
//! A session is identified by `session_key = channel ":" chat_id`. It owns an
//! ordered message history and an optional running summary. Sessions are
//! created on first inbound message, persisted after every turn (one JSON
//! file each), and survive process restarts. History is truncated only by
//! the summarization path; the summary is never replayed into history.

use chrono::{DateTime, Utc};
use mclaw_core::message::{Message, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

/// A persisted conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            summary: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to persist session {key}: {reason}")]
    Persist { key: String, reason: String },
}

/// Stores sessions as an addressable collection keyed by session key.
///
/// Reads take a shared lock; each save is atomic with respect to a single
/// session (temp file + rename), so readers observe either the pre-state or
/// the post-state, never a partial write.
pub struct SessionManager {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Load the session from memory, falling back to disk, creating it
    /// fresh if neither has it.
    pub fn get_or_create(&self, key: &str) -> Session {
        if let Some(session) = self.sessions.read().unwrap_or_else(|p| p.into_inner()).get(key) {
            return session.clone();
        }

        let session = self.load_from_disk(key).unwrap_or_else(|| Session::new(key));
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), session.clone());
        session
    }

    /// Ordered history for a session (empty for unknown keys).
    pub fn get_history(&self, key: &str) -> Vec<Message> {
        self.get_or_create(key).messages
    }

    /// Running summary for a session (empty string when none).
    pub fn get_summary(&self, key: &str) -> String {
        self.get_or_create(key).summary
    }

    /// Append a message to a session's history.
    pub fn add_message(&self, key: &str, role: Role, content: impl Into<String>) {
        self.get_or_create(key);
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get_mut(key) {
            let message = match role {
                Role::User => Message::user(content.into()),
                Role::Assistant => Message::assistant(content.into()),
                Role::System => Message::system(content.into()),
                Role::Tool => Message::tool_result("", content.into()),
            };
            session.messages.push(message);
            session.updated_at = Utc::now();
        }
    }

    /// Replace the running summary.
    pub fn set_summary(&self, key: &str, summary: impl Into<String>) {
        self.get_or_create(key);
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get_mut(key) {
            session.summary = summary.into();
            session.updated_at = Utc::now();
        }
    }

    /// Keep only the last `keep_last` messages (the summarization path).
    pub fn truncate_history(&self, key: &str, keep_last: usize) {
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get_mut(key) {
            let len = session.messages.len();
            if len > keep_last {
                session.messages.drain(..len - keep_last);
                session.updated_at = Utc::now();
            }
        }
    }

    /// Persist a session to its file atomically.
    pub fn save(&self, key: &str) -> Result<(), SessionError> {
        let session = self.get_or_create(key);

        std::fs::create_dir_all(&self.dir).map_err(|e| SessionError::Persist {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let path = self.session_path(key);
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(&session).map_err(|e| SessionError::Persist {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        std::fs::write(&tmp, data)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|e| SessionError::Persist {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        debug!(session = key, messages = session.messages.len(), "Saved session");
        Ok(())
    }

    /// Forget a session in memory and on disk.
    pub fn clear(&self, key: &str) {
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        let _ = std::fs::remove_file(self.session_path(key));
    }

    /// All session keys known on disk.
    pub fn list_keys(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|data| serde_json::from_str::<Session>(&data).ok())
                        .map(|s| s.key)
                } else {
                    None
                }
            })
            .collect()
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    fn load_from_disk(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }
        let data = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&data) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt session file ignored");
                None
            }
        }
    }
}

/// Derive a filesystem-safe filename from a session key.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
