//! Text embedding via the Gemini embedContent endpoint.
//!
//! `Embedder` is a trait so the engine can be exercised with a deterministic
//! stub in tests; [`GeminiEmbedder`] is the production implementation against
//! `text-embedding-004` (free tier).

use async_trait::async_trait;
use mclaw_core::error::MemoryError;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const GEMINI_EMBED_MODEL: &str = "text-embedding-004";
const GEMINI_EMBED_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Produces a fixed-dimension float vector per text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Gemini embedding client.
pub struct GeminiEmbedder {
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl GeminiEmbedder {
    /// `api_base` may be empty to use the default Gemini endpoint.
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Result<Self, MemoryError> {
        let api_base: String = api_base.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MemoryError::EmbeddingFailed(format!("failed to build client: {e}")))?;

        Ok(Self {
            api_key: api_key.into(),
            api_base: if api_base.is_empty() {
                GEMINI_EMBED_BASE_URL.into()
            } else {
                api_base.trim_end_matches('/').to_string()
            },
            client,
        })
    }

    pub fn model(&self) -> &'static str {
        GEMINI_EMBED_MODEL
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    #[serde(default)]
    values: Vec<f32>,
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.api_base, GEMINI_EMBED_MODEL, self.api_key
        );

        let body = serde_json::json!({
            "model": format!("models/{GEMINI_EMBED_MODEL}"),
            "content": { "parts": [ { "text": text } ] },
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(format!("embedding request failed: {e}")))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(format!("failed to read response: {e}")))?;

        if status != 200 {
            return Err(MemoryError::EmbeddingFailed(format!(
                "embedding API error {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }

        let parsed: EmbedResponse = serde_json::from_slice(&bytes)
            .map_err(|e| MemoryError::EmbeddingFailed(format!("failed to parse response: {e}")))?;

        if parsed.embedding.values.is_empty() {
            return Err(MemoryError::EmbeddingFailed("empty embedding returned".into()));
        }

        debug!(
            chars = text.len(),
            dims = parsed.embedding.values.len(),
            "Embedded text"
        );
        Ok(parsed.embedding.values)
    }
}
