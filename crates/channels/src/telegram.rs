//! Telegram channel adapter — Bot API long polling.
//!
//! `start` spawns a background fetcher that long-polls `getUpdates`;
//! each update is normalized and published on the bus via the shared
//! [`BaseChannel::handle_message`] path with a compound sender id
//! (`"<id>|<username>"`). `send` delivers via `sendMessage`, chunking long
//! text and retrying on 429 with the server-suggested delay (capped).

use crate::base::{retry_delay, BaseChannel, MAX_SEND_RETRIES};
use crate::Channel;
use async_trait::async_trait;
use mclaw_core::error::ChannelError;
use mclaw_core::{MessageBus, OutboundMessage};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;
/// Telegram rejects messages longer than 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4096;

pub struct TelegramChannel {
    base: Arc<BaseChannel>,
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>, allow_from: Vec<String>, bus: Arc<MessageBus>) -> Self {
        Self::with_api_base(token, allow_from, bus, API_BASE)
    }

    /// Point the adapter at a different API host (tests, local bot servers).
    pub fn with_api_base(
        token: impl Into<String>,
        allow_from: Vec<String>,
        bus: Arc<MessageBus>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            base: Arc::new(BaseChannel::new("telegram", bus, allow_from)),
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut offset: i64 = 0;

        while self.base.is_running() {
            let url = self.method_url("getUpdates");
            let result = self
                .client
                .get(&url)
                .query(&[
                    ("offset", offset.to_string()),
                    ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ])
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "Telegram getUpdates failed; backing off");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    continue;
                }
            };

            let body = match response.text().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Telegram getUpdates body read failed");
                    continue;
                }
            };

            for update in parse_updates(&body) {
                offset = offset.max(update.update_id + 1);
                let Some(inbound) = normalize_update(update) else {
                    continue;
                };
                self.base.handle_message(
                    &inbound.sender_id,
                    &inbound.chat_id,
                    &inbound.content,
                    Vec::new(),
                    inbound.metadata,
                );
            }
        }

        debug!("Telegram poll loop exited");
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if self.token.is_empty() {
            return Err(ChannelError::NotConfigured("telegram token missing".into()));
        }
        if self.base.is_running() {
            return Ok(());
        }
        self.base.set_running(true);

        let this = Arc::new(Self {
            base: Arc::clone(&self.base),
            token: self.token.clone(),
            api_base: self.api_base.clone(),
            client: self.client.clone(),
        });
        tokio::spawn(this.poll_loop());

        info!("Telegram channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        self.base.set_running(false);
        info!("Telegram channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        for chunk in chunk_message(&msg.content, MAX_MESSAGE_CHARS) {
            self.send_chunk(&msg.chat_id, &chunk).await?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        self.base.is_allowed(sender_id)
    }
}

impl TelegramChannel {
    async fn send_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let url = self.method_url("sendMessage");
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });

        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| ChannelError::DeliveryFailed {
                    channel: "telegram".into(),
                    reason: e.to_string(),
                })?;

            let status = response.status().as_u16();
            if status == 200 {
                return Ok(());
            }

            let body_text = response.text().await.unwrap_or_default();
            if status == 429 && attempt <= MAX_SEND_RETRIES {
                let suggested = parse_retry_after(&body_text).unwrap_or(1);
                let delay = retry_delay(suggested);
                warn!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Telegram rate limited; retrying send"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(ChannelError::DeliveryFailed {
                channel: "telegram".into(),
                reason: format!("sendMessage status {status}: {body_text}"),
            });
        }
    }
}

// --- Bot API wire types ---

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

struct NormalizedUpdate {
    sender_id: String,
    chat_id: String,
    content: String,
    metadata: HashMap<String, String>,
}

fn parse_updates(body: &str) -> Vec<Update> {
    match serde_json::from_str::<UpdatesResponse>(body) {
        Ok(resp) if resp.ok => resp.result,
        Ok(_) => {
            warn!("Telegram getUpdates returned ok=false");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse getUpdates response");
            Vec::new()
        }
    }
}

/// Convert an update into bus-ready fields. Non-text updates are dropped.
fn normalize_update(update: Update) -> Option<NormalizedUpdate> {
    let message = update.message?;
    let text = message.text?;
    let from = message.from?;

    // Compound sender id, so allow-lists can match either the numeric id or
    // the full "id|username" form.
    let sender_id = match from.username {
        Some(username) if !username.is_empty() => format!("{}|{}", from.id, username),
        _ => from.id.to_string(),
    };

    Some(NormalizedUpdate {
        sender_id,
        chat_id: message.chat.id.to_string(),
        content: text,
        metadata: HashMap::new(),
    })
}

/// Extract `parameters.retry_after` from a 429 response body.
fn parse_retry_after(body: &str) -> Option<u64> {
    #[derive(Deserialize)]
    struct ErrorBody {
        parameters: Option<Parameters>,
    }
    #[derive(Deserialize)]
    struct Parameters {
        retry_after: Option<u64>,
    }

    serde_json::from_str::<ErrorBody>(body)
        .ok()?
        .parameters?
        .retry_after
}

/// Split text into chunks of at most `max_chars` characters, on char
/// boundaries.
fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}
