//! Memory domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Memory categories
pub const CATEGORY_PREFERENCE: &str = "preference";
pub const CATEGORY_FACT: &str = "fact";
pub const CATEGORY_CONTEXT: &str = "context";
pub const CATEGORY_INSTRUCTION: &str = "instruction";

/// A single memory fact stored for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub user_id: String,
    pub content: String,
    /// preference, fact, context, instruction
    pub category: String,
    /// Vector embedding of `content` (not serialized to JSON)
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// Importance score in [0, 1]
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Advisory access counter feeding auto-pruning
    pub access_count: i64,
}

impl MemoryItem {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            user_id: user_id.into(),
            content: content.into(),
            category: CATEGORY_FACT.into(),
            embedding: Vec::new(),
            score: 0.5,
            created_at: now,
            updated_at: now,
            access_count: 0,
        }
    }
}

/// A memory search hit with its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub item: MemoryItem,
    pub similarity: f64,
}

/// What to do with a new fact relative to existing memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsolidateAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "NOOP")]
    Noop,
}

/// The outcome of the consolidation decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidateResult {
    pub action: ConsolidateAction,
    /// Existing memory to update/delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Merged content for UPDATE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConsolidateResult {
    pub fn add(reason: impl Into<String>) -> Self {
        Self {
            action: ConsolidateAction::Add,
            target_id: None,
            merged_content: None,
            reason: Some(reason.into()),
        }
    }
}

/// A fact extracted from a conversation by the LLM. Transient; lives only
/// during post-turn processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub importance: f64,
}

/// Statistics about a user's memories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub user_id: String,
    pub total_count: usize,
    pub categories: HashMap<String, usize>,
}

/// Safely truncate a string for logging.
pub(crate) fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_len).collect();
    format!("{cut}...")
}
