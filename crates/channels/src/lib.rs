//! Chat channel implementations for MClaw.
//!
//! Each channel connects a messaging transport to the message bus: native
//! events are normalized into [`mclaw_core::InboundMessage`]s and published
//! inbound; the registry's dispatcher consumes the outbound queue and routes
//! responses back by channel name.
//!
//! Available channels:
//! - **Telegram** — Bot API long polling with 429-aware send retry
//! - **Registry** — channel table + outbound dispatcher

pub mod base;
pub mod registry;
pub mod telegram;

pub use base::BaseChannel;
pub use registry::ChannelRegistry;
pub use telegram::TelegramChannel;

use async_trait::async_trait;
use mclaw_core::error::ChannelError;
use mclaw_core::OutboundMessage;

/// The transport abstraction.
///
/// `start` must return quickly, spawning its own background fetcher. `send`
/// is best-effort delivery with internal retry on transport rate limits.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique transport tag (e.g. "telegram").
    fn name(&self) -> &str;

    /// Begin receiving; spawns a background fetcher and returns.
    async fn start(&self) -> Result<(), ChannelError>;

    /// Stop receiving.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Deliver a response to the transport.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;

    fn is_running(&self) -> bool;

    /// Allow-list filter; an empty list allows everyone.
    fn is_allowed(&self, sender_id: &str) -> bool;
}
