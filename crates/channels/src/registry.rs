//! Channel registry — manages active channel instances and routes outbound
//! messages from the bus back to the right transport.

use crate::Channel;
use mclaw_core::error::ChannelError;
use mclaw_core::MessageBus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Central registry holding all enabled channel instances.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register a channel adapter.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "Registered channel");
        self.channels.insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Start every registered channel.
    pub async fn start_all(&self) -> Result<(), ChannelError> {
        for (name, channel) in &self.channels {
            channel.start().await?;
            info!(channel = %name, "Started channel");
        }
        Ok(())
    }

    /// Stop every registered channel.
    pub async fn stop_all(&self) {
        for (name, channel) in &self.channels {
            if let Err(e) = channel.stop().await {
                warn!(channel = %name, error = %e, "Failed to stop channel");
            }
        }
    }

    /// Consume the outbound bus queue and route each message to its channel.
    /// Runs until the bus closes; spawn this on its own task.
    pub async fn dispatch_outbound(self: Arc<Self>, bus: Arc<MessageBus>) {
        while let Some(msg) = bus.consume_outbound().await {
            let Some(channel) = self.channels.get(&msg.channel) else {
                warn!(channel = %msg.channel, "Dropping outbound message for unknown channel");
                continue;
            };
            if let Err(e) = channel.send(&msg).await {
                warn!(channel = %msg.channel, error = %e, "Outbound delivery failed");
            }
        }
    }
}
