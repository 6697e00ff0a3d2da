//! Streaming OpenAI-compatible HTTP provider.
//!
//! Requests are always made with `stream: true`. The SSE stream is folded
//! into a single [`LlmResponse`]: content deltas are concatenated, the
//! reasoning channel (`reasoning_content` / `reasoning` delta keys) is kept
//! separate from regular content, and tool-call fragments are accumulated by
//! per-call `index` — id, name, and appended argument JSON — then parsed at
//! stream end (falling back to `{"raw": ...}` on malformed arguments).
//!
//! Some gateways ignore `stream: true` and answer with a plain JSON body;
//! that case is detected via Content-Type and parsed directly.

use async_trait::async_trait;
use futures::StreamExt;
use mclaw_core::error::ProviderError;
use mclaw_core::message::Message;
use mclaw_core::provider::{
    parse_arguments, ChatOptions, LlmProvider, LlmResponse, ToolCallRequest, ToolDefinition, Usage,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible LLM provider over HTTP.
#[derive(Debug)]
pub struct HttpProvider {
    api_key: String,
    api_base: String,
    /// When set, replaces the requested model name (used when the routing
    /// layer strips provider prefixes for direct endpoints).
    model_override: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        model_override: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model_override,
            client,
        })
    }

    /// Convert domain messages to the OpenAI wire format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: Some(m.content.clone()),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        options: ChatOptions,
    ) -> Result<LlmResponse, ProviderError> {
        if self.api_base.is_empty() {
            return Err(ProviderError::NotConfigured("API base not set".into()));
        }

        let actual_model = self.model_override.as_deref().unwrap_or(model);

        let mut body = serde_json::json!({
            "model": actual_model,
            "messages": Self::to_api_messages(messages),
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(tools));
            body["tool_choice"] = serde_json::json!("auto");
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let url = format!("{}/chat/completions", self.api_base);
        debug!(model = %actual_model, messages = messages.len(), "POST {url}");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited { body });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // Some gateways answer non-streamed despite stream=true.
        if !content_type.contains("text/event-stream") && !content_type.contains("text/plain") {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ProviderError::Network(e.to_string()))?;
            debug!(len = bytes.len(), "Non-streamed response body");
            return parse_complete_body(&bytes);
        }

        let mut accumulator = StreamAccumulator::new();
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::StreamInterrupted(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);
                if accumulator.push_line(&line) {
                    break 'outer;
                }
            }
        }

        let resp = accumulator.finish();
        debug!(
            content = resp.content.len(),
            thinking = resp.thinking.len(),
            tools = resp.tool_calls.len(),
            "Stream complete"
        );
        Ok(resp)
    }

    fn default_model(&self) -> Option<&str> {
        self.model_override.as_deref()
    }
}

/// Folds SSE `data:` lines into a complete response.
pub(crate) struct StreamAccumulator {
    content: String,
    thinking: String,
    finish_reason: Option<String>,
    tool_calls: HashMap<u32, PartialToolCall>,
    usage: Option<Usage>,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            content: String::new(),
            thinking: String::new(),
            finish_reason: None,
            tool_calls: HashMap::new(),
            usage: None,
        }
    }

    /// Process one SSE line. Returns `true` when the stream signalled
    /// completion with `[DONE]`.
    pub(crate) fn push_line(&mut self, line: &str) -> bool {
        let Some(data) = line.strip_prefix("data: ") else {
            return false;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return true;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(error = %e, "Ignoring unparseable SSE chunk");
                return false;
            }
        };

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return false;
        };

        // Thinking arrives under either delta key depending on the gateway.
        let thinking = choice
            .delta
            .reasoning_content
            .or(choice.delta.reasoning)
            .unwrap_or_default();
        if !thinking.is_empty() {
            self.thinking.push_str(&thinking);
        }

        if let Some(content) = choice.delta.content {
            self.content.push_str(&content);
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let partial = self.tool_calls.entry(tc.index).or_default();
            if let Some(id) = tc.id {
                partial.id = id;
            }
            if let Some(function) = tc.function {
                if let Some(name) = function.name {
                    partial.name = name;
                }
                if let Some(args) = function.arguments {
                    partial.arguments.push_str(&args);
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        false
    }

    pub(crate) fn finish(self) -> LlmResponse {
        let mut indexed: Vec<(u32, PartialToolCall)> = self.tool_calls.into_iter().collect();
        indexed.sort_by_key(|(i, _)| *i);

        let tool_calls = indexed
            .into_iter()
            .map(|(_, partial)| ToolCallRequest {
                id: partial.id,
                name: partial.name,
                arguments: parse_arguments(&partial.arguments),
            })
            .collect();

        LlmResponse {
            content: self.content,
            thinking: self.thinking,
            tool_calls,
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

/// Parse a non-streamed `/chat/completions` JSON body.
fn parse_complete_body(body: &[u8]) -> Result<LlmResponse, ProviderError> {
    let api: CompleteResponse = serde_json::from_slice(body).map_err(|e| ProviderError::ApiError {
        status_code: 200,
        message: format!("Failed to parse response: {e}"),
    })?;

    let Some(choice) = api.choices.into_iter().next() else {
        return Ok(LlmResponse {
            finish_reason: Some("stop".into()),
            ..LlmResponse::default()
        });
    };

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, parse_arguments(&f.arguments)),
                None => (String::new(), serde_json::json!({})),
            };
            ToolCallRequest {
                id: tc.id,
                name,
                arguments,
            }
        })
        .collect();

    Ok(LlmResponse {
        content: choice.message.content.unwrap_or_default(),
        thinking: String::new(),
        tool_calls,
        finish_reason: choice.finish_reason,
        usage: api.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
    })
}

// --- OpenAI wire types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta — arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// --- Non-streamed response types ---

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    #[serde(default)]
    choices: Vec<CompleteChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct CompleteChoice {
    message: CompleteMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompleteToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompleteToolCall {
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: Option<CompleteFunction>,
}

#[derive(Debug, Deserialize)]
struct CompleteFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mclaw_core::message::AssistantToolCall;

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api = HttpProvider::to_api_messages(&messages);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
    }

    #[test]
    fn message_conversion_with_tool_calls() {
        let mut msg = Message::assistant("");
        msg.tool_calls.push(AssistantToolCall {
            id: "call_1".into(),
            name: "exec".into(),
            arguments: r#"{"command":"ls"}"#.into(),
        });
        let api = HttpProvider::to_api_messages(&[msg]);
        let tc = api[0].tool_calls.as_ref().unwrap();
        assert_eq!(tc.len(), 1);
        assert_eq!(tc[0].function.name, "exec");
        assert_eq!(tc[0].r#type, "function");
    }

    #[test]
    fn message_conversion_tool_result() {
        let msg = Message::tool_result("call_1", "result data");
        let api = HttpProvider::to_api_messages(&[msg]);
        assert_eq!(api[0].role, "tool");
        assert_eq!(api[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn stream_content_delta() {
        let mut acc = StreamAccumulator::new();
        acc.push_line(r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#);
        acc.push_line(r#"data: {"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#);
        let resp = acc.finish();
        assert_eq!(resp.content, "Hello");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn stream_done_signal() {
        let mut acc = StreamAccumulator::new();
        assert!(!acc.push_line(r#"data: {"choices":[{"delta":{"content":"x"}}]}"#));
        assert!(acc.push_line("data: [DONE]"));
    }

    #[test]
    fn stream_ignores_non_data_lines_and_garbage() {
        let mut acc = StreamAccumulator::new();
        assert!(!acc.push_line(""));
        assert!(!acc.push_line(": keep-alive comment"));
        assert!(!acc.push_line("data: {not json"));
        let resp = acc.finish();
        assert!(resp.content.is_empty());
    }

    #[test]
    fn stream_separates_thinking_from_content() {
        let mut acc = StreamAccumulator::new();
        acc.push_line(
            r#"data: {"choices":[{"delta":{"reasoning_content":"step 1... "},"finish_reason":null}]}"#,
        );
        acc.push_line(r#"data: {"choices":[{"delta":{"reasoning":"step 2"},"finish_reason":null}]}"#);
        acc.push_line(r#"data: {"choices":[{"delta":{"content":"Answer"},"finish_reason":null}]}"#);
        let resp = acc.finish();
        assert_eq!(resp.thinking, "step 1... step 2");
        assert_eq!(resp.content, "Answer");
    }

    #[test]
    fn stream_accumulates_tool_call_fragments() {
        let mut acc = StreamAccumulator::new();
        acc.push_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"read_file","arguments":""}}]},"finish_reason":null}]}"#,
        );
        acc.push_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\""}}]},"finish_reason":null}]}"#,
        );
        acc.push_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":": \"/tmp/x\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        );
        let resp = acc.finish();
        assert_eq!(resp.tool_calls.len(), 1);
        let tc = &resp.tool_calls[0];
        assert_eq!(tc.id, "call_abc");
        assert_eq!(tc.name, "read_file");
        assert_eq!(tc.arguments["path"], "/tmp/x");
    }

    #[test]
    fn stream_multiple_parallel_tool_calls_ordered_by_index() {
        let mut acc = StreamAccumulator::new();
        acc.push_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"list_dir","arguments":"{}"}},{"index":0,"id":"call_a","function":{"name":"exec","arguments":"{}"}}]},"finish_reason":null}]}"#,
        );
        let resp = acc.finish();
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].id, "call_a");
        assert_eq!(resp.tool_calls[1].id, "call_b");
    }

    #[test]
    fn stream_malformed_arguments_fall_back_to_raw() {
        let mut acc = StreamAccumulator::new();
        acc.push_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"exec","arguments":"{\"cmd\": "}}]},"finish_reason":null}]}"#,
        );
        let resp = acc.finish();
        assert_eq!(resp.tool_calls[0].arguments["raw"], "{\"cmd\": ");
    }

    #[test]
    fn stream_usage_captured() {
        let mut acc = StreamAccumulator::new();
        acc.push_line(
            r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        let resp = acc.finish();
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn complete_body_parse() {
        let body = br#"{
            "choices": [{
                "message": {
                    "content": "hi there",
                    "tool_calls": [
                        {"id": "c1", "type": "function",
                         "function": {"name": "exec", "arguments": "{\"command\":\"ls\"}"}}
                    ]
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        }"#;
        let resp = parse_complete_body(body).unwrap();
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments["command"], "ls");
        assert_eq!(resp.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn complete_body_no_choices() {
        let resp = parse_complete_body(br#"{"choices": []}"#).unwrap();
        assert!(resp.content.is_empty());
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn provider_requires_api_base() {
        let provider = HttpProvider::new("key", "", None).unwrap();
        let err = futures::executor::block_on(provider.chat(
            &[Message::user("hi")],
            &[],
            "test-model",
            ChatOptions::default(),
        ))
        .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}
