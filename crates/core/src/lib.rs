//! # MClaw Core
//!
//! Domain types, traits, and error definitions for the MClaw personal agent
//! runtime. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait or value type here. Implementations
//! live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod bus;
pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use error::{ChannelError, Error, MemoryError, ProviderError, Result, ToolError};
pub use message::{AssistantToolCall, Message, Role};
pub use provider::{ChatOptions, LlmProvider, LlmResponse, ToolCallRequest, ToolDefinition, Usage};
pub use tool::{Tool, ToolRegistry};
