//! The agent reasoning loop.
//!
//! One inbound message produces exactly one response string (possibly empty)
//! plus committed side effects: session history, a detached memory write,
//! and — when the compression trigger fires — an off-path summarization pass
//! under a per-session single-flight guard.

use crate::context::ContextBuilder;
use crate::model_switcher::ModelSwitcher;
use mclaw_config::Config;
use mclaw_core::bus::{InboundMessage, MessageBus, OutboundMessage};
use mclaw_core::error::ProviderError;
use mclaw_core::message::{estimate_tokens, AssistantToolCall, Message, Role};
use mclaw_core::provider::{arguments_to_string, ChatOptions, ToolDefinition};
use mclaw_core::tool::ToolRegistry;
use mclaw_memory::MemoryEngine;
use mclaw_session::SessionManager;
use mclaw_tools::DeliveryContext;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const MESSAGE_DEADLINE: Duration = Duration::from_secs(600);
const SUMMARIZE_DEADLINE: Duration = Duration::from_secs(120);
const MAX_CONSECUTIVE_TOOL_ERRORS: u32 = 3;
const MAX_CONSECUTIVE_TOOL_ONLY: u32 = 10;
/// Messages kept verbatim when summarization truncates history.
const KEEP_LAST: usize = 4;
/// History length that forces a compression pass.
const COMPRESS_LEN_THRESHOLD: usize = 20;
/// Summarization targets longer than this are split in half and merged.
const SPLIT_THRESHOLD: usize = 10;
const THINKING_PREVIEW_CHARS: usize = 3500;
const RESPONSE_MAX_TOKENS: u32 = 8192;

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    switcher: Arc<ModelSwitcher>,
    sessions: Arc<SessionManager>,
    tools: Arc<ToolRegistry>,
    memory: Option<Arc<MemoryEngine>>,
    delivery_context: Option<Arc<DeliveryContext>>,
    context_builder: ContextBuilder,
    workspace: PathBuf,
    context_window: usize,
    temperature: f32,
    max_iterations: u32,
    /// Sessions with an in-flight summarization pass.
    summarizing: Mutex<HashSet<String>>,
    running: AtomicBool,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &Config,
        bus: Arc<MessageBus>,
        switcher: Arc<ModelSwitcher>,
        sessions: Arc<SessionManager>,
        tools: Arc<ToolRegistry>,
        memory: Option<Arc<MemoryEngine>>,
        delivery_context: Option<Arc<DeliveryContext>>,
    ) -> Arc<Self> {
        let workspace = cfg.workspace_path();
        Arc::new(Self {
            bus,
            switcher,
            sessions,
            tools,
            memory,
            delivery_context,
            context_builder: ContextBuilder::new(&workspace),
            workspace,
            context_window: cfg.agents.defaults.max_tokens as usize,
            temperature: cfg.agents.defaults.temperature,
            max_iterations: cfg.agents.defaults.max_tool_iterations,
            summarizing: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Consume the inbound bus until it closes or [`stop`](Self::stop) is
    /// called. Sequential per process: messages are handled in arrival order.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!("Agent loop running");

        while self.running.load(Ordering::SeqCst) {
            let Some(msg) = self.bus.consume_inbound().await else {
                break;
            };

            let response = match self.process_message(msg.clone()).await {
                Ok(r) => r,
                Err(e) => format_error_for_user(&e),
            };

            if !response.is_empty() {
                self.bus.publish_outbound(OutboundMessage {
                    channel: msg.channel,
                    chat_id: msg.chat_id,
                    content: response,
                });
            }
        }

        info!("Agent loop stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Process a prompt outside any transport (CLI one-shots, cron,
    /// heartbeat).
    pub async fn process_direct(
        self: &Arc<Self>,
        content: &str,
        session_key: &str,
    ) -> Result<String, ProviderError> {
        self.process_message(InboundMessage {
            channel: "cli".into(),
            sender_id: "user".into(),
            chat_id: "direct".into(),
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
            session_key: session_key.into(),
        })
        .await
    }

    /// One turn under the per-message wall-clock deadline.
    pub async fn process_message(
        self: &Arc<Self>,
        msg: InboundMessage,
    ) -> Result<String, ProviderError> {
        match tokio::time::timeout(MESSAGE_DEADLINE, self.process_inner(msg)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(
                "message processing exceeded the 10 minute deadline".into(),
            )),
        }
    }

    async fn process_inner(self: &Arc<Self>, msg: InboundMessage) -> Result<String, ProviderError> {
        // Current chat context for cron auto-delivery defaults.
        if let Some(ctx) = &self.delivery_context {
            ctx.set(&msg.channel, &msg.chat_id);
        }

        let history = self.sessions.get_history(&msg.session_key);
        let summary = self.sessions.get_summary(&msg.session_key);

        let memories = match &self.memory {
            Some(engine) => match engine.recall_memories(&msg.sender_id, &msg.content, 0).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(error = %e, "Memory recall failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let mut messages =
            self.context_builder
                .build_messages(&history, &summary, &msg.content, &memories);

        let mut iteration: u32 = 0;
        let mut final_content = String::new();
        let mut consecutive_tool_errors: u32 = 0;
        let mut consecutive_tool_only: u32 = 0;

        while iteration < self.max_iterations {
            iteration += 1;

            // Too many consecutive all-failed tool rounds: withhold tools to
            // force a natural-language answer.
            let tool_defs: Vec<ToolDefinition> =
                if consecutive_tool_errors >= MAX_CONSECUTIVE_TOOL_ERRORS {
                    warn!(
                        consecutive_tool_errors,
                        "Too many consecutive tool errors, forcing text-only response"
                    );
                    Vec::new()
                } else {
                    self.tools.definitions()
                };

            debug!(iteration, model = %self.switcher.current_model(), "Calling LLM");
            let response = self
                .switcher
                .chat(
                    &messages,
                    &tool_defs,
                    ChatOptions::new(RESPONSE_MAX_TOKENS, self.temperature),
                )
                .await?;

            // Relay a truncated reasoning trace out-of-band where supported.
            if !response.thinking.is_empty() && msg.channel != "cli" {
                let mut preview: String =
                    response.thinking.chars().take(THINKING_PREVIEW_CHARS).collect();
                if response.thinking.chars().count() > THINKING_PREVIEW_CHARS {
                    preview.push_str("\n...(truncated)");
                }
                self.bus.publish_outbound(OutboundMessage {
                    channel: msg.channel.clone(),
                    chat_id: msg.chat_id.clone(),
                    content: format!("💭 *Thinking:*\n\n{preview}"),
                });
            }

            if response.tool_calls.is_empty() {
                final_content = response.content;
                break;
            }

            if response.content.is_empty() {
                consecutive_tool_only += 1;
            } else {
                consecutive_tool_only = 0;
            }
            if consecutive_tool_only >= MAX_CONSECUTIVE_TOOL_ONLY {
                warn!(
                    consecutive_tool_only,
                    "Breaking: consecutive tool-only iterations with no text content"
                );
                final_content = response.content;
                if final_content.is_empty() {
                    final_content = "I've been working on your request but encountered difficulties. Could you try rephrasing or being more specific?".into();
                }
                break;
            }

            let mut assistant = Message::assistant(response.content.clone());
            assistant.tool_calls = response
                .tool_calls
                .iter()
                .map(|tc| AssistantToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: arguments_to_string(&tc.arguments),
                })
                .collect();
            messages.push(assistant);

            let mut all_failed = true;
            for tc in &response.tool_calls {
                debug!(tool = %tc.name, "Executing tool");
                let result = match self.tools.execute(&tc.name, tc.arguments.clone()).await {
                    Ok(output) => {
                        all_failed = false;
                        output
                    }
                    Err(e) => {
                        warn!(tool = %tc.name, error = %e, "Tool execution failed");
                        format!(
                            "Error: {e}\n\nHint: If this is a path error, make sure to use absolute paths. Your workspace is at {}.",
                            self.workspace.display()
                        )
                    }
                };
                messages.push(Message::tool_result(&tc.id, result));
            }

            if all_failed {
                consecutive_tool_errors += 1;
            } else {
                consecutive_tool_errors = 0;
            }
        }

        if final_content.is_empty() {
            final_content = "I've completed processing but have no response to give.".into();
        }

        self.commit_turn(&msg, &final_content);
        Ok(final_content)
    }

    /// Post-turn actions: history append + save, detached memory write, and
    /// the compression trigger.
    fn commit_turn(self: &Arc<Self>, msg: &InboundMessage, final_content: &str) {
        self.sessions
            .add_message(&msg.session_key, Role::User, msg.content.clone());
        self.sessions
            .add_message(&msg.session_key, Role::Assistant, final_content.to_string());

        // Detached memory write: immutable copies, failures never reach the
        // caller. The engine applies its own fresh deadline.
        if let Some(engine) = &self.memory {
            let engine = Arc::clone(engine);
            let user_id = msg.sender_id.clone();
            let turn = vec![
                Message::user(msg.content.clone()),
                Message::assistant(final_content.to_string()),
            ];
            tokio::spawn(async move {
                engine.process_conversation(&user_id, turn).await;
            });
        }

        // Compression trigger: history length or estimated token pressure.
        let new_history = self.sessions.get_history(&msg.session_key);
        let token_estimate = estimate_tokens(&new_history);
        let threshold = self.context_window * 75 / 100;

        if new_history.len() > COMPRESS_LEN_THRESHOLD || token_estimate > threshold {
            self.spawn_summarization(&msg.session_key);
        }

        if let Err(e) = self.sessions.save(&msg.session_key) {
            warn!(error = %e, "Failed to persist session");
        }
    }

    /// Start an off-path summarization pass unless one is already running
    /// for this session.
    fn spawn_summarization(self: &Arc<Self>, session_key: &str) {
        {
            let mut summarizing = self.summarizing.lock().unwrap_or_else(|p| p.into_inner());
            if !summarizing.insert(session_key.to_string()) {
                return;
            }
        }

        let this = Arc::clone(self);
        let key = session_key.to_string();
        tokio::spawn(async move {
            if tokio::time::timeout(SUMMARIZE_DEADLINE, this.summarize_session(&key))
                .await
                .is_err()
            {
                warn!(session = %key, "Summarization timed out");
            }
            this.summarizing
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&key);
        });
    }

    /// Compress everything but the last [`KEEP_LAST`] messages into the
    /// running summary, then truncate history.
    async fn summarize_session(&self, session_key: &str) {
        let history = self.sessions.get_history(session_key);
        let summary = self.sessions.get_summary(session_key);

        if history.len() <= KEEP_LAST {
            return;
        }
        let to_summarize = &history[..history.len() - KEEP_LAST];

        // Drop individual messages too large for the summarizer itself.
        let max_message_tokens = self.context_window / 2;
        let mut omitted = false;
        let valid: Vec<&Message> = to_summarize
            .iter()
            .filter(|m| m.role == Role::User || m.role == Role::Assistant)
            .filter(|m| {
                if m.estimated_tokens() > max_message_tokens {
                    omitted = true;
                    false
                } else {
                    true
                }
            })
            .collect();

        if valid.is_empty() {
            return;
        }

        let mut final_summary = if valid.len() > SPLIT_THRESHOLD {
            let mid = valid.len() / 2;
            let s1 = self.summarize_batch(&valid[..mid], "").await.unwrap_or_default();
            let s2 = self.summarize_batch(&valid[mid..], "").await.unwrap_or_default();

            let merge_prompt = format!(
                "Merge these two conversation summaries into one cohesive summary:\n\n1: {s1}\n\n2: {s2}"
            );
            match self
                .switcher
                .chat(&[Message::user(merge_prompt)], &[], ChatOptions::new(1024, 0.3))
                .await
            {
                Ok(response) => response.content,
                Err(_) => format!("{s1} {s2}"),
            }
        } else {
            self.summarize_batch(&valid, &summary).await.unwrap_or_default()
        };

        if omitted && !final_summary.is_empty() {
            final_summary.push_str(
                "\n[Note: Some oversized messages were omitted from this summary for efficiency.]",
            );
        }

        if !final_summary.is_empty() {
            self.sessions.set_summary(session_key, final_summary);
            self.sessions.truncate_history(session_key, KEEP_LAST);
            if let Err(e) = self.sessions.save(session_key) {
                warn!(error = %e, "Failed to persist session after summarization");
            }
            debug!(session = session_key, "Summarized session");
        }
    }

    async fn summarize_batch(
        &self,
        batch: &[&Message],
        existing_summary: &str,
    ) -> Result<String, ProviderError> {
        let mut prompt = String::from(
            "Provide a concise summary of this conversation segment, preserving core context and key points.\n",
        );
        if !existing_summary.is_empty() {
            prompt.push_str(&format!("Existing context: {existing_summary}\n"));
        }
        prompt.push_str("\nCONVERSATION:\n");
        for m in batch {
            prompt.push_str(&format!("{}: {}\n", m.role, m.content));
        }

        let response = self
            .switcher
            .chat(&[Message::user(prompt)], &[], ChatOptions::new(1024, 0.3))
            .await?;
        Ok(response.content)
    }

    #[cfg(test)]
    fn is_summarizing(&self, session_key: &str) -> bool {
        self.summarizing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(session_key)
    }
}

/// Map an error to the short user-visible string for the channel.
pub fn format_error_for_user(err: &ProviderError) -> String {
    match err {
        ProviderError::RateLimited { .. } => {
            "⚠️ API rate limit reached. Please wait a moment and try again.".into()
        }
        ProviderError::Timeout(_) => {
            "⏰ Request timed out. The AI took too long to respond. Please try a simpler question or try again.".into()
        }
        ProviderError::AuthenticationFailed(_) => {
            "🔑 API authentication error. Please check your API key configuration.".into()
        }
        ProviderError::ApiError { status_code, .. } if (500..=599).contains(status_code) => {
            "🔧 AI service is temporarily unavailable. Please try again later.".into()
        }
        other => {
            let mut text = other.to_string();
            if text.chars().count() > 200 {
                text = text.chars().take(200).collect::<String>() + "...";
            }
            format!("❌ Error: {text}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_switcher::ProviderFactory;
    use async_trait::async_trait;
    use mclaw_core::provider::{LlmProvider, LlmResponse, ToolCallRequest};
    use mclaw_core::tool::Tool;
    use mclaw_core::ToolError;
    use mclaw_memory::{Embedder, MemoryEngine, MemoryStore, ProviderFn};
    use std::collections::VecDeque;

    /// Provider scripted with a queue of responses; records what it saw.
    #[derive(Debug)]
    struct ScriptedProvider {
        replies: Mutex<VecDeque<LlmResponse>>,
        tool_counts: Mutex<Vec<usize>>,
        system_prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                tool_counts: Mutex::new(Vec::new()),
                system_prompts: Mutex::new(Vec::new()),
            })
        }

        fn text(content: &str) -> LlmResponse {
            LlmResponse {
                content: content.into(),
                ..LlmResponse::default()
            }
        }

        fn tool_call(id: &str, name: &str, args: serde_json::Value) -> LlmResponse {
            LlmResponse {
                tool_calls: vec![ToolCallRequest {
                    id: id.into(),
                    name: name.into(),
                    arguments: args,
                }],
                ..LlmResponse::default()
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(
            &self,
            messages: &[Message],
            tools: &[mclaw_core::provider::ToolDefinition],
            _model: &str,
            _options: ChatOptions,
        ) -> Result<LlmResponse, ProviderError> {
            self.tool_counts.lock().unwrap().push(tools.len());
            if let Some(system) = messages.iter().find(|m| m.role == Role::System) {
                self.system_prompts.lock().unwrap().push(system.content.clone());
            }
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::text("(out of scripted replies)")))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> String {
            "Echoes back the input".into()
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
            Ok(format!("echo: {}", args["text"].as_str().unwrap_or("")))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> String {
            "Always fails".into()
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
            Err(ToolError::ExecutionFailed {
                tool_name: "broken".into(),
                reason: "no such path".into(),
            })
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        bus: Arc<MessageBus>,
        agent: Arc<AgentLoop>,
        provider: Arc<ScriptedProvider>,
        sessions: Arc<SessionManager>,
    }

    fn harness_with(
        replies: Vec<LlmResponse>,
        tools: Vec<Arc<dyn Tool>>,
        memory: Option<Arc<MemoryEngine>>,
    ) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.agents.defaults.workspace = tmp.path().join("workspace").to_string_lossy().into_owned();

        let provider = ScriptedProvider::new(replies);
        let factory: ProviderFactory = {
            let p = Arc::clone(&provider);
            Arc::new(move |_cfg, _model| Ok(Arc::clone(&p) as Arc<dyn LlmProvider>))
        };
        let switcher = Arc::new(ModelSwitcher::with_factory(
            &cfg,
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            factory,
        ));

        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }

        let bus = Arc::new(MessageBus::new());
        let sessions = Arc::new(SessionManager::new(tmp.path().join("sessions")));
        let agent = AgentLoop::new(
            &cfg,
            Arc::clone(&bus),
            switcher,
            Arc::clone(&sessions),
            Arc::new(registry),
            memory,
            None,
        );

        Harness {
            _tmp: tmp,
            bus,
            agent,
            provider,
            sessions,
        }
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            sender_id: "u1".into(),
            chat_id: "c1".into(),
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
            session_key: "telegram:c1".into(),
        }
    }

    #[tokio::test]
    async fn simple_text_response_commits_history() {
        let h = harness_with(vec![ScriptedProvider::text("Hello there!")], vec![], None);

        let response = h.agent.process_message(inbound("hi")).await.unwrap();
        assert_eq!(response, "Hello there!");

        let history = h.sessions.get_history("telegram:c1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello there!");
    }

    #[tokio::test]
    async fn tool_call_loop_executes_and_continues() {
        let h = harness_with(
            vec![
                ScriptedProvider::tool_call("call_1", "echo", serde_json::json!({"text": "ping"})),
                ScriptedProvider::text("The tool said: echo: ping"),
            ],
            vec![Arc::new(EchoTool)],
            None,
        );

        let response = h.agent.process_message(inbound("use the tool")).await.unwrap();
        assert_eq!(response, "The tool said: echo: ping");
        // Two LLM calls: tool round + final round.
        assert_eq!(h.provider.tool_counts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn consecutive_tool_errors_withhold_tools() {
        // Three all-failed rounds, then the model must be offered no tools.
        let h = harness_with(
            vec![
                ScriptedProvider::tool_call("c1", "broken", serde_json::json!({})),
                ScriptedProvider::tool_call("c2", "broken", serde_json::json!({})),
                ScriptedProvider::tool_call("c3", "broken", serde_json::json!({})),
                ScriptedProvider::text("Giving a plain answer instead."),
            ],
            vec![Arc::new(FailingTool)],
            None,
        );

        let response = h.agent.process_message(inbound("try hard")).await.unwrap();
        assert_eq!(response, "Giving a plain answer instead.");

        let counts = h.provider.tool_counts.lock().unwrap().clone();
        assert_eq!(counts.len(), 4);
        assert!(counts[0] > 0 && counts[1] > 0 && counts[2] > 0);
        assert_eq!(counts[3], 0, "fourth round must offer no tools");
    }

    #[tokio::test]
    async fn tool_only_iterations_capped_with_fallback_text() {
        // The model keeps calling tools with no text; the loop must bail at
        // the cap with the canned message.
        let replies: Vec<LlmResponse> = (0..15)
            .map(|i| {
                ScriptedProvider::tool_call(
                    &format!("c{i}"),
                    "echo",
                    serde_json::json!({"text": "again"}),
                )
            })
            .collect();
        let h = harness_with(replies, vec![Arc::new(EchoTool)], None);

        let response = h.agent.process_message(inbound("loop forever")).await.unwrap();
        assert!(response.contains("encountered difficulties"));
        // Exactly the cap's worth of LLM calls.
        assert_eq!(
            h.provider.tool_counts.lock().unwrap().len(),
            MAX_CONSECUTIVE_TOOL_ONLY as usize
        );
    }

    #[tokio::test]
    async fn max_iterations_bound_produces_canned_reply() {
        // Alternate text+tool rounds so the tool-only counter keeps
        // resetting; the iteration bound is the limiting factor.
        let replies: Vec<LlmResponse> = (0..25)
            .map(|i| LlmResponse {
                content: format!("step {i}"),
                tool_calls: vec![ToolCallRequest {
                    id: format!("c{i}"),
                    name: "echo".into(),
                    arguments: serde_json::json!({"text": "x"}),
                }],
                ..LlmResponse::default()
            })
            .collect();
        let h = harness_with(replies, vec![Arc::new(EchoTool)], None);

        let response = h.agent.process_message(inbound("never finish")).await.unwrap();
        assert!(response.contains("no response to give"));
        assert_eq!(h.provider.tool_counts.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn thinking_relayed_out_of_band() {
        let h = harness_with(
            vec![LlmResponse {
                content: "final answer".into(),
                thinking: "let me reason about this".into(),
                ..LlmResponse::default()
            }],
            vec![],
            None,
        );

        let response = h.agent.process_message(inbound("question")).await.unwrap();
        assert_eq!(response, "final answer");

        let out = h.bus.consume_outbound().await.unwrap();
        assert!(out.content.starts_with("💭 *Thinking:*"));
        assert!(out.content.contains("let me reason about this"));
    }

    #[tokio::test]
    async fn compression_trigger_summarizes_to_four_messages() {
        // Seed 21 messages, process one more turn (-> 23), and expect the
        // spawned summarization to leave history at 4 with a summary.
        let h = harness_with(
            vec![
                ScriptedProvider::text("turn reply"),
                ScriptedProvider::text("summary part 1"),
                ScriptedProvider::text("summary part 2"),
                ScriptedProvider::text("merged summary of everything"),
            ],
            vec![],
            None,
        );

        for i in 0..21 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            h.sessions.add_message("telegram:c1", role, format!("message {i}"));
        }

        let response = h.agent.process_message(inbound("one more")).await.unwrap();
        assert_eq!(response, "turn reply");

        // Wait for the detached summarization to finish.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !h.agent.is_summarizing("telegram:c1")
                && h.sessions.get_history("telegram:c1").len() == 4
            {
                break;
            }
        }

        let history = h.sessions.get_history("telegram:c1");
        assert_eq!(history.len(), 4, "history truncated to keep-last");
        let summary = h.sessions.get_summary("telegram:c1");
        assert_eq!(summary, "merged summary of everything");
        // 1 turn call + 2 halves + 1 merge.
        assert_eq!(h.provider.tool_counts.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn short_history_does_not_summarize() {
        let h = harness_with(vec![ScriptedProvider::text("ok")], vec![], None);
        h.agent.process_message(inbound("hello")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.sessions.get_summary("telegram:c1").is_empty());
        assert_eq!(h.provider.tool_counts.lock().unwrap().len(), 1);
    }

    // --- memory integration (fact recall across session reset) ---

    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, mclaw_core::MemoryError> {
            let lower = text.to_lowercase();
            let features = ["thích", "cà phê", "rust"];
            let mut v: Vec<f32> = features
                .iter()
                .map(|f| if lower.contains(f) { 1.0 } else { 0.0 })
                .collect();
            if v.iter().all(|x| *x == 0.0) {
                v.push(0.01);
            } else {
                v.push(0.0);
            }
            Ok(v)
        }
    }

    #[tokio::test]
    async fn fact_recall_across_session_reset() {
        // Session 1 states two facts; after the memory pipeline runs, a new
        // session must see them recalled into the system prompt.
        let extraction = ScriptedProvider::text(
            r#"[{"content":"Tôi thích cà phê đen","category":"preference","importance":0.8},{"content":"User is learning Rust","category":"fact","importance":0.7}]"#,
        );
        let memory_provider = ScriptedProvider::new(vec![extraction]);
        let store = Arc::new(MemoryStore::new("sqlite::memory:").await.unwrap());
        let provider_fn: ProviderFn = {
            let p = Arc::clone(&memory_provider);
            Arc::new(move || (Arc::clone(&p) as Arc<dyn LlmProvider>, "test-model".into()))
        };
        let engine = Arc::new(MemoryEngine::new(
            store.clone(),
            Arc::new(KeywordEmbedder),
            provider_fn,
            "",
            5,
            0.3,
            1000,
        ));

        let h = harness_with(
            vec![
                ScriptedProvider::text("Đã ghi nhớ!"),
                ScriptedProvider::text("Bạn thích cà phê đen."),
            ],
            vec![],
            Some(Arc::clone(&engine)),
        );

        // Session 1.
        h.agent
            .process_message(inbound("Tôi thích cà phê đen và đang học Rust."))
            .await
            .unwrap();

        // Wait for the detached memory pipeline.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get_by_user("u1").await.unwrap().len() == 2 {
                break;
            }
        }
        let items = store.get_by_user("u1").await.unwrap();
        assert_eq!(items.len(), 2);
        let categories: Vec<&str> = items.iter().map(|m| m.category.as_str()).collect();
        assert!(categories.contains(&"preference"));
        assert!(categories.contains(&"fact"));

        // Reset the session, keep the memories.
        h.sessions.clear("telegram:c1");

        // Session 2: the recall block must mention the coffee preference.
        h.agent
            .process_message(inbound("Tôi thích uống gì nhỉ?"))
            .await
            .unwrap();

        let prompts = h.provider.system_prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert!(last.contains("## Recalled memories"));
        assert!(last.contains("cà phê đen"));
    }

    #[test]
    fn error_classifier_strings() {
        assert!(format_error_for_user(&ProviderError::RateLimited { body: "x".into() })
            .contains("rate limit"));
        assert!(format_error_for_user(&ProviderError::Timeout("t".into())).contains("timed out"));
        assert!(
            format_error_for_user(&ProviderError::AuthenticationFailed("k".into()))
                .contains("authentication")
        );
        assert!(format_error_for_user(&ProviderError::ApiError {
            status_code: 503,
            message: "unavailable".into(),
        })
        .contains("temporarily unavailable"));

        let long = ProviderError::Network("x".repeat(500));
        let formatted = format_error_for_user(&long);
        assert!(formatted.starts_with("❌ Error:"));
        assert!(formatted.chars().count() < 300);
    }
}
