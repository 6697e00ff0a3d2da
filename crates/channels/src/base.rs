//! Shared channel plumbing: allow-list filtering and inbound publication.

use mclaw_core::{InboundMessage, MessageBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Common state embedded by concrete channel adapters.
pub struct BaseChannel {
    name: String,
    bus: Arc<MessageBus>,
    allow_list: Vec<String>,
    running: AtomicBool,
}

impl BaseChannel {
    pub fn new(name: impl Into<String>, bus: Arc<MessageBus>, allow_list: Vec<String>) -> Self {
        Self {
            name: name.into(),
            bus,
            allow_list,
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Allow-list check. An empty list allows everyone. Sender ids may be
    /// compound ("414383435|username"); the part before `|` is also matched.
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        if self.allow_list.is_empty() {
            return true;
        }

        let id_part = match sender_id.split_once('|') {
            Some((id, _)) if !id.is_empty() => id,
            _ => sender_id,
        };

        self.allow_list
            .iter()
            .any(|allowed| allowed == sender_id || allowed == id_part)
    }

    /// Normalize a native event and publish it inbound. Disallowed senders
    /// are dropped silently.
    pub fn handle_message(
        &self,
        sender_id: &str,
        chat_id: &str,
        content: &str,
        media: Vec<String>,
        metadata: HashMap<String, String>,
    ) {
        if !self.is_allowed(sender_id) {
            debug!(channel = %self.name, sender = sender_id, "Dropping message from disallowed sender");
            return;
        }

        self.bus.publish_inbound(InboundMessage {
            channel: self.name.clone(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media,
            metadata,
            session_key: InboundMessage::session_key_for(&self.name, chat_id),
        });
    }
}

/// Retry policy for transport sends that hit a rate limit: bounded attempts,
/// honoring the server-suggested delay capped at 10 seconds.
pub const MAX_SEND_RETRIES: u32 = 3;
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Clamp a server-suggested retry delay.
pub fn retry_delay(suggested_secs: u64) -> Duration {
    Duration::from_secs(suggested_secs).min(MAX_RETRY_DELAY)
}
