//! Intelligent memory layer for MClaw.
//!
//! Runs the pipeline **extract → embed → retrieve-similar → consolidate →
//! persist** once per user turn, strictly off the response path. Recall runs
//! on the response path, before the LLM call, to inject relevant facts.
//!
//! - [`MemoryStore`] — per-user SQLite store with cosine top-K search
//! - [`Extractor`] — LLM fact extraction with robust JSON parsing
//! - [`Consolidator`] — ADD/UPDATE/DELETE/NOOP decisions vs existing memories
//! - [`Embedder`] / [`GeminiEmbedder`] — text → fixed-dimension vectors
//! - [`MemoryEngine`] — orchestrates the whole pipeline

mod consolidator;
mod embedder;
mod engine;
mod extractor;
mod store;
mod types;
mod vector;

pub use consolidator::Consolidator;
pub use embedder::{Embedder, GeminiEmbedder};
pub use engine::{MemoryEngine, ProviderFn};
pub use extractor::Extractor;
pub use store::MemoryStore;
pub use types::{
    ConsolidateAction, ConsolidateResult, ExtractedFact, MemoryItem, MemoryStats, SearchResult,
    CATEGORY_CONTEXT, CATEGORY_FACT, CATEGORY_INSTRUCTION, CATEGORY_PREFERENCE,
};
pub use vector::{cosine_similarity, decode_embedding, encode_embedding};
