//! LLM provider implementations for MClaw.
//!
//! One adapter covers the vast majority of backends, since most expose an
//! OpenAI-compatible `/chat/completions` endpoint: OpenRouter, OpenAI,
//! Gemini's compatibility layer, Zhipu, Groq, vLLM, and custom proxies.
//!
//! - [`HttpProvider`] — streaming chat with tool-call accumulation
//! - [`create_provider_for_model`] — model-name → provider routing

mod http;
mod routing;

pub use http::HttpProvider;
pub use routing::{create_provider, create_provider_for_model};
