//! Message bus — transport-agnostic inbound/outbound queues.
//!
//! Channels publish inbound messages; the agent loop consumes them, processes
//! a turn, and publishes the response outbound; the channel dispatcher routes
//! outbound messages back to the right transport.
//!
//! Publication is non-blocking; consumption blocks until a message arrives or
//! every producer handle has been dropped.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// A message received from a chat transport, normalized for the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Transport tag (e.g. "telegram", "cli")
    pub channel: String,
    /// Platform sender identifier, possibly compound ("id|displayname")
    pub sender_id: String,
    /// The chat/group/DM identifier within the channel
    pub chat_id: String,
    /// The text content
    pub content: String,
    /// Attachment paths or URLs
    pub media: Vec<String>,
    /// Platform-specific metadata
    pub metadata: HashMap<String, String>,
    /// `channel ":" chat_id` — identifies the conversation thread
    pub session_key: String,
}

impl InboundMessage {
    /// Build a session key the way channels do.
    pub fn session_key_for(channel: &str, chat_id: &str) -> String {
        format!("{channel}:{chat_id}")
    }
}

/// A response headed back to a chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

/// The process-wide message bus.
///
/// Both queues are unbounded: `publish_*` never blocks the caller. Producer
/// and consumer are never the same task.
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    /// Publish an inbound message. Non-blocking; drops silently only if the
    /// bus itself has been torn down.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        let _ = self.inbound_tx.send(msg);
    }

    /// Publish an outbound message. Non-blocking.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        let _ = self.outbound_tx.send(msg);
    }

    /// Block until an inbound message arrives. Returns `None` once the bus
    /// is closed.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Block until an outbound message arrives. Returns `None` once the bus
    /// is closed.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            sender_id: "414383435".into(),
            chat_id: "chat1".into(),
            content: content.into(),
            media: vec![],
            metadata: HashMap::new(),
            session_key: InboundMessage::session_key_for("telegram", "chat1"),
        }
    }

    #[tokio::test]
    async fn publish_consume_preserves_order() {
        let bus = MessageBus::new();
        bus.publish_inbound(inbound("first"));
        bus.publish_inbound(inbound("second"));

        assert_eq!(bus.consume_inbound().await.unwrap().content, "first");
        assert_eq!(bus.consume_inbound().await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn outbound_round_trip() {
        let bus = MessageBus::new();
        bus.publish_outbound(OutboundMessage {
            channel: "telegram".into(),
            chat_id: "chat1".into(),
            content: "reply".into(),
        });
        let msg = bus.consume_outbound().await.unwrap();
        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.content, "reply");
    }

    #[test]
    fn session_key_format() {
        assert_eq!(
            InboundMessage::session_key_for("telegram", "12345"),
            "telegram:12345"
        );
    }

    #[tokio::test]
    async fn publish_is_nonblocking() {
        let bus = MessageBus::new();
        // Many publishes with no consumer must not block or panic.
        for i in 0..1000 {
            bus.publish_inbound(inbound(&format!("m{i}")));
        }
        assert_eq!(bus.consume_inbound().await.unwrap().content, "m0");
    }
}
