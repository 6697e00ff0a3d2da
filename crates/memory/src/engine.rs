//! The memory engine: orchestrates extract → embed → retrieve-similar →
//! consolidate → persist, strictly off the response path.

use crate::consolidator::Consolidator;
use crate::embedder::{Embedder, GeminiEmbedder};
use crate::extractor::Extractor;
use crate::store::MemoryStore;
use crate::types::{truncate_for_log, ConsolidateAction, ExtractedFact, MemoryStats, SearchResult};
use mclaw_config::Config;
use mclaw_core::error::MemoryError;
use mclaw_core::message::Message;
use mclaw_core::provider::LlmProvider;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Returns the *current* provider/model pair for extraction and
/// consolidation. Wired to the model switcher so memory LLM calls follow
/// rate-limit fallback.
pub type ProviderFn = Arc<dyn Fn() -> (Arc<dyn LlmProvider>, String) + Send + Sync>;

const PROCESS_TIMEOUT: Duration = Duration::from_secs(120);
const CONSOLIDATE_TOP_K: usize = 3;
const CONSOLIDATE_MIN_SCORE: f64 = 0.5;

pub struct MemoryEngine {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    provider_fn: ProviderFn,
    extract_model: String,
    top_k: usize,
    min_score: f64,
    max_memories: usize,
    /// In-flight processing per user (single-flight guard).
    processing: Mutex<HashSet<String>>,
}

impl MemoryEngine {
    /// Assemble an engine from explicit parts. `extract_model` empty means
    /// "use whatever model the provider getter returns".
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        provider_fn: ProviderFn,
        extract_model: impl Into<String>,
        top_k: usize,
        min_score: f64,
        max_memories: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            provider_fn,
            extract_model: extract_model.into(),
            top_k: if top_k == 0 { 5 } else { top_k },
            min_score: if min_score <= 0.0 { 0.3 } else { min_score },
            max_memories: if max_memories == 0 { 1000 } else { max_memories },
            processing: Mutex::new(HashSet::new()),
        }
    }

    /// Build the production engine from configuration. Returns `None` when
    /// the memory layer is disabled.
    pub async fn from_config(
        cfg: &Config,
        provider_fn: ProviderFn,
    ) -> Result<Option<Arc<Self>>, MemoryError> {
        if !cfg.memory.enabled {
            return Ok(None);
        }

        // Resolve the embedding key: memory.api_key → providers.gemini.api_key
        let api_key = if cfg.memory.api_key.is_empty() {
            cfg.providers.gemini.api_key.clone()
        } else {
            cfg.memory.api_key.clone()
        };
        if api_key.is_empty() {
            return Err(MemoryError::EmbeddingFailed(
                "no Gemini API key for memory embedding (set memory.api_key or providers.gemini.api_key)"
                    .into(),
            ));
        }

        let db_path = cfg.data_dir().join("memory.db");
        let store = Arc::new(MemoryStore::new(&db_path.to_string_lossy()).await?);
        let embedder = Arc::new(GeminiEmbedder::new(api_key, cfg.memory.api_base.clone())?);

        let engine = Arc::new(Self::new(
            store,
            embedder,
            provider_fn,
            cfg.memory.extract_model.clone(),
            cfg.memory.top_k,
            cfg.memory.min_score,
            cfg.memory.max_memories,
        ));

        info!(
            top_k = engine.top_k,
            min_score = engine.min_score,
            "Memory engine initialized"
        );
        Ok(Some(engine))
    }

    fn extraction_backend(&self) -> (Arc<dyn LlmProvider>, String) {
        let (provider, mut model) = (self.provider_fn)();
        if !self.extract_model.is_empty() {
            model = self.extract_model.clone();
        }
        (provider, model)
    }

    /// Search for relevant memories for a query. Called BEFORE the LLM
    /// response to inject context. `top_k == 0` uses the configured default.
    pub async fn recall_memories(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, MemoryError> {
        let top_k = if top_k == 0 { self.top_k } else { top_k };

        let query_embedding = self.embedder.embed(query).await?;
        let results = self
            .store
            .search(&query_embedding, user_id, top_k, self.min_score)
            .await?;

        if !results.is_empty() {
            debug!(
                count = results.len(),
                user = user_id,
                "Recalled memories (query: {})",
                truncate_for_log(query, 50)
            );
        }
        Ok(results)
    }

    /// Extract facts from a conversation turn and fold them into the store.
    /// Runs AFTER the LLM response, detached from the caller, under a fresh
    /// 2-minute deadline. A per-user single-flight guard drops overlapping
    /// invocations; failures are logged, never surfaced.
    pub async fn process_conversation(&self, user_id: &str, messages: Vec<Message>) {
        let _guard = match SingleFlight::acquire(&self.processing, user_id) {
            Some(g) => g,
            None => return,
        };

        if let Err(_elapsed) = tokio::time::timeout(
            PROCESS_TIMEOUT,
            self.process_conversation_inner(user_id, &messages),
        )
        .await
        {
            warn!(user = user_id, "Memory processing timed out");
        }
    }

    async fn process_conversation_inner(&self, user_id: &str, messages: &[Message]) {
        let (provider, model) = self.extraction_backend();
        let extractor = Extractor::new(provider.clone(), model.clone());

        let facts = match extractor.extract(messages).await {
            Ok(f) => f,
            Err(e) => {
                warn!(user = user_id, error = %e, "Fact extraction failed");
                return;
            }
        };
        if facts.is_empty() {
            return;
        }

        debug!(count = facts.len(), user = user_id, "Processing extracted facts");

        let consolidator = Consolidator::new(provider, model);
        for fact in facts {
            if let Err(e) = self.process_fact(user_id, &fact, &consolidator).await {
                warn!(
                    user = user_id,
                    error = %e,
                    "Failed to process fact '{}'",
                    truncate_for_log(&fact.content, 50)
                );
            }
        }

        if let Err(e) = self.store.prune(user_id, self.max_memories).await {
            warn!(user = user_id, error = %e, "Prune failed");
        }
    }

    /// One fact through embed → similar → consolidate → apply.
    async fn process_fact(
        &self,
        user_id: &str,
        fact: &ExtractedFact,
        consolidator: &Consolidator,
    ) -> Result<(), MemoryError> {
        let embedding = self.embedder.embed(&fact.content).await?;

        let similar = self
            .store
            .search(&embedding, user_id, CONSOLIDATE_TOP_K, CONSOLIDATE_MIN_SCORE)
            .await?;

        let decision = consolidator
            .consolidate(&fact.content, &similar)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("consolidation LLM call failed: {e}")))?;

        match decision.action {
            ConsolidateAction::Add => self.add_fact(user_id, fact, embedding).await,
            ConsolidateAction::Update => {
                match (decision.target_id, decision.merged_content) {
                    (Some(target_id), Some(merged)) if !target_id.is_empty() && !merged.is_empty() => {
                        // Re-embed the merged content before writing.
                        let new_embedding = self.embedder.embed(&merged).await?;
                        self.store.update(&target_id, &merged, &new_embedding).await
                    }
                    // Target or content missing — fall back to ADD.
                    _ => self.add_fact(user_id, fact, embedding).await,
                }
            }
            ConsolidateAction::Delete => {
                if let Some(target_id) = decision.target_id.filter(|t| !t.is_empty()) {
                    self.store.delete(&target_id).await?;
                }
                Ok(())
            }
            ConsolidateAction::Noop => {
                debug!(
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "NOOP: {}",
                    truncate_for_log(&fact.content, 50)
                );
                Ok(())
            }
        }
    }

    async fn add_fact(
        &self,
        user_id: &str,
        fact: &ExtractedFact,
        embedding: Vec<f32>,
    ) -> Result<(), MemoryError> {
        let mut item = crate::types::MemoryItem::new(user_id, fact.content.clone());
        item.category = fact.category.clone();
        item.score = fact.importance;
        item.embedding = embedding;
        self.store.add(&mut item).await
    }

    pub async fn get_stats(&self, user_id: &str) -> Result<MemoryStats, MemoryError> {
        self.store.get_stats(user_id).await
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

/// RAII guard releasing the per-user single-flight slot, even on panic or
/// early return.
struct SingleFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> SingleFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, key: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|p| p.into_inner());
        if !guard.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set,
            key: key.to_string(),
        })
    }
}

impl Drop for SingleFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|p| p.into_inner());
        guard.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mclaw_core::error::ProviderError;
    use mclaw_core::provider::{ChatOptions, LlmResponse, ToolDefinition};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Keyword-feature embedder: deterministic, and texts sharing keywords
    /// land close together in the vector space.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
            let lower = text.to_lowercase();
            let features = ["coffee", "cà phê", "rust", "music", "travel"];
            let mut v: Vec<f32> = features
                .iter()
                .map(|f| if lower.contains(f) { 1.0 } else { 0.0 })
                .collect();
            if v.iter().all(|x| *x == 0.0) {
                v[features.len() - 1] = 0.01; // avoid the zero vector
            }
            Ok(v)
        }
    }

    /// Provider scripted with a queue of replies.
    #[derive(Debug)]
    struct QueueProvider {
        replies: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl QueueProvider {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for QueueProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _model: &str,
            _options: ChatOptions,
        ) -> Result<LlmResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop().unwrap_or_default();
            Ok(LlmResponse {
                content: reply,
                ..LlmResponse::default()
            })
        }
    }

    async fn engine_with(provider: Arc<QueueProvider>) -> (Arc<MemoryEngine>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new("sqlite::memory:").await.unwrap());
        let provider_fn: ProviderFn = {
            let provider = provider.clone();
            Arc::new(move || (provider.clone() as Arc<dyn LlmProvider>, "test-model".into()))
        };
        let engine = Arc::new(MemoryEngine::new(
            store.clone(),
            Arc::new(KeywordEmbedder),
            provider_fn,
            "",
            5,
            0.3,
            1000,
        ));
        (engine, store)
    }

    fn turn(user: &str, assistant: &str) -> Vec<Message> {
        vec![Message::user(user), Message::assistant(assistant)]
    }

    #[tokio::test]
    async fn pipeline_stores_extracted_facts() {
        let provider = QueueProvider::new(vec![
            // extraction
            r#"[{"content":"User likes coffee","category":"preference","importance":0.7},{"content":"User is learning Rust","category":"fact","importance":0.8}]"#,
        ]);
        let (engine, store) = engine_with(provider).await;

        engine
            .process_conversation("u1", turn("I like coffee and I'm learning Rust", "Noted!"))
            .await;

        let items = store.get_by_user("u1").await.unwrap();
        assert_eq!(items.len(), 2);
        let categories: Vec<&str> = items.iter().map(|m| m.category.as_str()).collect();
        assert!(categories.contains(&"preference"));
        assert!(categories.contains(&"fact"));
    }

    #[tokio::test]
    async fn consolidation_update_path_reembeds() {
        // Seed an existing coffee memory.
        let provider = QueueProvider::new(vec![
            // extraction for the new turn
            r#"[{"content":"User prefers black coffee without sugar","category":"preference","importance":0.8}]"#,
            // consolidation decision (target filled in below)
            "PLACEHOLDER",
        ]);
        let (engine, store) = engine_with(provider.clone()).await;

        let mut seed = crate::types::MemoryItem::new("u1", "User likes coffee.");
        seed.category = "preference".into();
        seed.embedding = KeywordEmbedder.embed("User likes coffee.").await.unwrap();
        store.add(&mut seed).await.unwrap();

        // Patch the consolidation reply with the real seed id. Replies pop
        // from the end, so the extraction reply goes back on top.
        {
            let mut replies = provider.replies.lock().unwrap();
            let extraction = replies.pop().unwrap();
            let decision = format!(
                r#"{{"action":"UPDATE","target_id":"{}","merged_content":"User prefers black coffee without sugar","reason":"extends"}}"#,
                seed.id
            );
            replies.clear();
            replies.push(decision);
            replies.push(extraction);
        }

        engine
            .process_conversation("u1", turn("Tôi thích cà phê đen không đường", "Đã ghi nhớ!"))
            .await;

        let items = store.get_by_user("u1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "User prefers black coffee without sugar");
        // Embedding was refreshed for the merged content.
        let expected = KeywordEmbedder
            .embed("User prefers black coffee without sugar")
            .await
            .unwrap();
        assert_eq!(items[0].embedding, expected);
    }

    #[tokio::test]
    async fn update_without_target_falls_back_to_add() {
        let provider = QueueProvider::new(vec![
            r#"[{"content":"User likes coffee strongly","category":"preference","importance":0.8}]"#,
            r#"{"action":"UPDATE","reason":"missing target"}"#,
        ]);
        let (engine, store) = engine_with(provider).await;

        let mut seed = crate::types::MemoryItem::new("u1", "User likes coffee.");
        seed.embedding = KeywordEmbedder.embed("User likes coffee.").await.unwrap();
        store.add(&mut seed).await.unwrap();

        engine
            .process_conversation("u1", turn("I really like coffee", "Noted"))
            .await;

        // Fallback ADD: both the seed and the new fact are present.
        assert_eq!(store.get_by_user("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn noop_discards_fact() {
        let provider = QueueProvider::new(vec![
            r#"[{"content":"User likes coffee","category":"preference","importance":0.7}]"#,
            r#"{"action":"NOOP","reason":"already known"}"#,
        ]);
        let (engine, store) = engine_with(provider).await;

        let mut seed = crate::types::MemoryItem::new("u1", "User likes coffee");
        seed.embedding = KeywordEmbedder.embed("User likes coffee").await.unwrap();
        store.add(&mut seed).await.unwrap();

        engine
            .process_conversation("u1", turn("I like coffee", "Yes, I know!"))
            .await;

        assert_eq!(store.get_by_user("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extraction_garbage_is_nonfatal() {
        let provider = QueueProvider::new(vec!["I refuse to answer in JSON."]);
        let (engine, store) = engine_with(provider).await;

        engine.process_conversation("u1", turn("hello", "hi")).await;
        assert!(store.get_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recall_finds_keyword_neighbors() {
        let provider = QueueProvider::new(vec![]);
        let (engine, store) = engine_with(provider).await;

        let mut seed = crate::types::MemoryItem::new("u1", "Tôi thích cà phê đen");
        seed.category = "preference".into();
        seed.embedding = KeywordEmbedder.embed("Tôi thích cà phê đen").await.unwrap();
        store.add(&mut seed).await.unwrap();

        let results = engine
            .recall_memories("u1", "Tôi thích uống cà phê gì nhỉ?", 0)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].item.content.contains("cà phê đen"));
    }

    #[tokio::test]
    async fn single_flight_drops_concurrent_processing() {
        let provider = QueueProvider::new(vec!["[]", "[]"]);
        let (engine, _store) = engine_with(provider.clone()).await;

        // Hold the guard manually, then try to process: it must bail without
        // touching the provider.
        let guard = SingleFlight::acquire(&engine.processing, "u1").unwrap();
        engine.process_conversation("u1", turn("a", "b")).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        drop(guard);

        // Released — processing proceeds.
        engine.process_conversation("u1", turn("a", "b")).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
