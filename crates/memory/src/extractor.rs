//! LLM-based fact extraction from conversation turns.

use crate::types::{truncate_for_log, ExtractedFact, CATEGORY_FACT};
use mclaw_core::error::ProviderError;
use mclaw_core::message::{Message, Role};
use mclaw_core::provider::{ChatOptions, LlmProvider};
use std::sync::Arc;
use tracing::{debug, warn};

const EXTRACT_PROMPT: &str = r#"You are a memory extraction system. Analyze the conversation below and extract important, reusable facts about the user.

RULES:
- Extract ONLY personal, reusable information (preferences, habits, facts about the user, instructions they've given)
- Do NOT extract ephemeral information (what time it is, current task progress, greetings)
- Do NOT extract information about the AI assistant itself
- Each fact should be a short, atomic statement
- Maximum 5 facts per conversation turn
- Assign a category: "preference" (likes/dislikes), "fact" (personal info), "context" (background/situation), "instruction" (how the user wants things done)
- Assign importance 0.0-1.0 (1.0 = critical personal info, 0.5 = useful context, 0.1 = minor detail)

RESPOND WITH ONLY A JSON ARRAY. No explanation, no markdown, no code blocks.
If no facts to extract, respond with: []

Example output:
[{"content":"User prefers dark mode in all applications","category":"preference","importance":0.7},{"content":"User is a Go developer based in Vietnam","category":"fact","importance":0.8}]

CONVERSATION:
"#;

const MAX_FACTS: usize = 5;

/// Extracts salient facts from a {user, assistant} turn with a deterministic
/// (temperature 0) LLM call.
pub struct Extractor {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl Extractor {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Analyze a conversation and return extracted facts.
    ///
    /// Any parse failure yields zero facts (non-fatal).
    pub async fn extract(&self, messages: &[Message]) -> Result<Vec<ExtractedFact>, ProviderError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut conversation = String::new();
        for m in messages {
            if m.role == Role::User || m.role == Role::Assistant {
                conversation.push_str(&format!("{}: {}\n", m.role, m.content));
            }
        }

        let prompt = format!("{EXTRACT_PROMPT}{conversation}");
        let response = self
            .provider
            .chat(
                &[Message::user(prompt)],
                &[],
                &self.model,
                ChatOptions::new(1024, 0.0),
            )
            .await?;

        let facts = parse_facts(&response.content);
        debug!(count = facts.len(), "Extracted facts from conversation");
        Ok(facts)
    }
}

/// Robust-parse the extractor output: strip code fences, repair a truncated
/// array, validate and clamp each fact. Failure yields an empty list.
pub(crate) fn parse_facts(raw: &str) -> Vec<ExtractedFact> {
    let content = strip_code_block(raw);
    let content = repair_json_array(&content);

    let facts: Vec<ExtractedFact> = match serde_json::from_str(&content) {
        Ok(f) => f,
        Err(e) => {
            warn!(
                error = %e,
                raw = %truncate_for_log(&content, 200),
                "Failed to parse extraction response"
            );
            return Vec::new();
        }
    };

    let mut valid: Vec<ExtractedFact> = facts
        .into_iter()
        .filter(|f| !f.content.is_empty())
        .map(|mut f| {
            f.importance = f.importance.clamp(0.0, 1.0);
            if f.category.is_empty() {
                f.category = CATEGORY_FACT.into();
            }
            f
        })
        .collect();

    valid.truncate(MAX_FACTS);
    valid
}

/// Remove a fenced markdown code block wrapper (```json ... ```).
pub(crate) fn strip_code_block(s: &str) -> String {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("```") {
        let body = match rest.split_once('\n') {
            Some((_, body)) => body,
            None => rest,
        };
        let body = match body.rfind("```") {
            Some(idx) => &body[..idx],
            None => body,
        };
        return body.trim().to_string();
    }
    s.to_string()
}

/// Attempt to fix a truncated JSON array by closing it after the last
/// complete object. Falls back to `[]` when unrepairable.
pub(crate) fn repair_json_array(s: &str) -> String {
    let s = s.trim();
    if !s.starts_with('[') {
        return s.to_string();
    }

    if serde_json::from_str::<serde_json::Value>(s).is_ok() {
        return s.to_string();
    }

    if let Some(last_complete) = s.rfind('}') {
        let repaired = format!("{}]", &s[..=last_complete]);
        if serde_json::from_str::<serde_json::Value>(&repaired).is_ok() {
            return repaired;
        }
    }

    "[]".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_array() {
        let facts = parse_facts(
            r#"[{"content":"User likes coffee","category":"preference","importance":0.7}]"#,
        );
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "User likes coffee");
        assert_eq!(facts[0].category, "preference");
    }

    #[test]
    fn parse_strips_code_fences() {
        let raw = "```json\n[{\"content\":\"User is learning Rust\",\"category\":\"fact\",\"importance\":0.8}]\n```";
        let facts = parse_facts(raw);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "User is learning Rust");
    }

    #[test]
    fn parse_repairs_truncated_array() {
        // Stream cut off mid-object: close after the last complete one.
        let raw = r#"[{"content":"A","category":"fact","importance":0.5},{"content":"B","cat"#;
        let facts = parse_facts(raw);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "A");
    }

    #[test]
    fn parse_garbage_yields_empty() {
        assert!(parse_facts("I cannot extract facts from this.").is_empty());
        assert!(parse_facts("").is_empty());
    }

    #[test]
    fn parse_empty_array() {
        assert!(parse_facts("[]").is_empty());
    }

    #[test]
    fn parse_clamps_importance_and_defaults_category() {
        let facts = parse_facts(r#"[{"content":"X","importance":3.5},{"content":"Y","importance":-1.0}]"#);
        assert_eq!(facts[0].importance, 1.0);
        assert_eq!(facts[0].category, "fact");
        assert_eq!(facts[1].importance, 0.0);
    }

    #[test]
    fn parse_caps_at_five_facts() {
        let raw = format!(
            "[{}]",
            (0..8)
                .map(|i| format!(r#"{{"content":"fact {i}","category":"fact","importance":0.5}}"#))
                .collect::<Vec<_>>()
                .join(",")
        );
        assert_eq!(parse_facts(&raw).len(), 5);
    }

    #[test]
    fn parse_drops_empty_content() {
        let facts = parse_facts(r#"[{"content":"","importance":0.5},{"content":"ok","importance":0.5}]"#);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "ok");
    }

    #[test]
    fn strip_code_block_without_language_tag() {
        assert_eq!(strip_code_block("```\n[1,2]\n```"), "[1,2]");
    }

    #[test]
    fn strip_code_block_passthrough() {
        assert_eq!(strip_code_block("  [1,2] "), "[1,2]");
    }

    #[test]
    fn repair_valid_array_unchanged() {
        assert_eq!(repair_json_array(r#"[{"a":1}]"#), r#"[{"a":1}]"#);
    }

    #[test]
    fn repair_non_array_unchanged() {
        assert_eq!(repair_json_array(r#"{"a":1}"#), r#"{"a":1}"#);
    }

    #[test]
    fn repair_unfixable_falls_back_to_empty() {
        assert_eq!(repair_json_array("[{{{"), "[]");
    }
}
