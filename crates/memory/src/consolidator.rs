//! Consolidation: decide how a new fact relates to existing memories.

use crate::extractor::strip_code_block;
use crate::types::{truncate_for_log, ConsolidateResult, SearchResult};
#[cfg(test)]
use crate::types::ConsolidateAction;
use mclaw_core::error::ProviderError;
use mclaw_core::message::Message;
use mclaw_core::provider::{ChatOptions, LlmProvider};
use std::sync::Arc;
use tracing::{debug, warn};

const CONSOLIDATE_PROMPT: &str = r#"You are a memory consolidation system. Given a NEW FACT and a list of EXISTING MEMORIES, decide the best action.

ACTIONS:
- "ADD": The fact is genuinely new information not covered by any existing memory
- "UPDATE": The fact updates or extends an existing memory (specify target_id and provide merged_content)
- "DELETE": The fact contradicts an existing memory, making it obsolete (specify target_id)
- "NOOP": The fact is already known or too similar to an existing memory

RULES:
- Be conservative: prefer NOOP over ADD to avoid duplicates
- When updating, merge the old and new info into one coherent statement
- Only DELETE when the new fact directly contradicts an old one
- Always provide a brief reason

RESPOND WITH ONLY JSON. No explanation, no markdown.

Example:
{"action":"UPDATE","target_id":"abc-123","merged_content":"User prefers Vietnamese coffee, specifically black coffee without sugar","reason":"Extends existing coffee preference with new detail"}
"#;

pub struct Consolidator {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl Consolidator {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Determine the appropriate action for a new fact.
    ///
    /// An empty similar-memory list short-circuits to ADD without an LLM
    /// call. Parse failures and unknown actions default to ADD.
    pub async fn consolidate(
        &self,
        new_fact: &str,
        existing: &[SearchResult],
    ) -> Result<ConsolidateResult, ProviderError> {
        if existing.is_empty() {
            return Ok(ConsolidateResult::add("No existing memories to compare"));
        }

        let mut memory_list = String::new();
        for m in existing {
            memory_list.push_str(&format!(
                "- [ID: {}] [{}] {} (similarity: {:.0}%)\n",
                m.item.id,
                m.item.category,
                m.item.content,
                m.similarity * 100.0
            ));
        }

        let prompt = format!(
            "{CONSOLIDATE_PROMPT}\nNEW FACT: {new_fact}\n\nEXISTING MEMORIES:\n{memory_list}"
        );

        let response = self
            .provider
            .chat(
                &[Message::user(prompt)],
                &[],
                &self.model,
                ChatOptions::new(512, 0.0),
            )
            .await?;

        let result = parse_consolidation(&response.content);
        debug!(
            action = ?result.action,
            target = result.target_id.as_deref().unwrap_or(""),
            reason = result.reason.as_deref().unwrap_or(""),
            "Consolidation decision"
        );
        Ok(result)
    }
}

/// Parse the consolidator output, defaulting to ADD on failure.
pub(crate) fn parse_consolidation(raw: &str) -> ConsolidateResult {
    let content = strip_code_block(raw);

    match serde_json::from_str::<ConsolidateResult>(&content) {
        Ok(result) => result,
        Err(e) => {
            warn!(
                error = %e,
                raw = %truncate_for_log(&content, 200),
                "Failed to parse consolidation response"
            );
            ConsolidateResult::add("Parse failure, defaulting to ADD")
        }
    }
}
