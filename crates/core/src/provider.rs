//! Provider trait — the abstraction over LLM backends.
//!
//! A provider knows how to send a conversation to an LLM and get a complete
//! response back, accumulating any streamed fragments internally.
//!
//! Implementations: any OpenAI-compatible endpoint (OpenRouter, OpenAI,
//! Gemini's compatibility layer, Zhipu, Groq, vLLM, custom proxies).

use crate::error::ProviderError;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Per-call sampling options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatOptions {
    pub fn new(max_tokens: u32, temperature: f32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
        }
    }
}

/// A parsed tool call from a completed response.
///
/// Unlike [`crate::message::AssistantToolCall`], arguments here are already
/// parsed into a JSON object mapping (with a `{"raw": ...}` fallback when the
/// model emitted unparseable argument text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete response from a provider, with the thinking/reasoning channel
/// separated from regular content.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// The core provider trait.
///
/// The agent loop calls `chat()` without knowing which backend is in use.
#[async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Send a conversation and receive the accumulated response.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        options: ChatOptions,
    ) -> std::result::Result<LlmResponse, ProviderError>;

    /// The model this provider prefers when none is specified.
    fn default_model(&self) -> Option<&str> {
        None
    }
}

/// Render tool call arguments for building the assistant wire message.
pub fn arguments_to_string(arguments: &serde_json::Value) -> String {
    serde_json::to_string(arguments).unwrap_or_else(|_| "{}".into())
}

/// Convenience: parse an arguments JSON string into a mapping, falling back
/// to `{"raw": "<text>"}` when the text is not valid JSON.
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<HashMap<String, serde_json::Value>>(raw) {
        Ok(map) => serde_json::to_value(map).unwrap_or_default(),
        Err(_) => serde_json::json!({ "raw": raw }),
    }
}
