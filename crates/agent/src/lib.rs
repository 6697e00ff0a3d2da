//! The MClaw agentic runtime core.
//!
//! - [`AgentLoop`] — drives tool-calling iterations against the LLM, commits
//!   session history, and kicks off post-turn memory writes and
//!   summarization
//! - [`ContextBuilder`] — assembles the prompt from identity, workspace
//!   context, summary, recalled memories, and raw history
//! - [`ModelSwitcher`] — rate-limit-triggered model fallback with daily
//!   reset to the primary

mod context;
mod loop_runner;
mod model_switcher;

pub use context::ContextBuilder;
pub use loop_runner::{format_error_for_user, AgentLoop};
pub use model_switcher::{ModelSwitcher, ProviderFactory};
