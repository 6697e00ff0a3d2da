//! Persistent memory store backed by SQLite.
//!
//! One database file, table `memories`, partitioned by `user_id`. Deletes
//! are soft (`deleted = 1`). Similarity search is a linear cosine scan over
//! the user's non-deleted rows — the per-user bound (max_memories, default
//! 1000) keeps O(N) scans cheap, so there is no ANN index.
//!
//! The pool is limited to a single connection: SQLite works best with a
//! single writer, and readers share that connection for the full scan.

use crate::types::{truncate_for_log, MemoryItem, MemoryStats, SearchResult};
use crate::vector::{cosine_similarity, decode_embedding, encode_embedding};
use chrono::{DateTime, Utc};
use mclaw_core::error::MemoryError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    /// Create or open the memory database at the given path.
    ///
    /// Parent directories are created. Pass `"sqlite::memory:"` for an
    /// ephemeral in-process database (tests).
    pub async fn new(db_path: &str) -> Result<Self, MemoryError> {
        if !db_path.contains(":memory:") {
            if let Some(dir) = Path::new(db_path).parent() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| MemoryError::Storage(format!("create memory dir: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_path)
            .map_err(|e| MemoryError::Storage(format!("invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("failed to open memory database: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Memory store initialized at {db_path}");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                content     TEXT NOT NULL,
                category    TEXT NOT NULL DEFAULT 'fact',
                embedding   BLOB,
                score       REAL NOT NULL DEFAULT 0.5,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                access_cnt  INTEGER NOT NULL DEFAULT 0,
                deleted     INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("memories table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id, deleted)")
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("user index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(user_id, category, deleted)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("category index: {e}")))?;

        Ok(())
    }

    /// Insert a new memory item. Generates an id when empty.
    pub async fn add(&self, item: &mut MemoryItem) -> Result<(), MemoryError> {
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        item.updated_at = Utc::now();

        // NULL rather than an empty blob, so embedding-less rows stay out of
        // similarity scans.
        let embedding_blob =
            (!item.embedding.is_empty()).then(|| encode_embedding(&item.embedding));

        sqlx::query(
            r#"
            INSERT INTO memories (id, user_id, content, category, embedding, score, created_at, updated_at, access_cnt)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&item.id)
        .bind(&item.user_id)
        .bind(&item.content)
        .bind(&item.category)
        .bind(embedding_blob)
        .bind(item.score)
        .bind(item.created_at.to_rfc3339())
        .bind(item.updated_at.to_rfc3339())
        .bind(item.access_count)
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("failed to add memory: {e}")))?;

        debug!(
            category = %item.category,
            user = %item.user_id,
            score = item.score,
            "Added memory: {}",
            truncate_for_log(&item.content, 60)
        );
        Ok(())
    }

    /// Replace an existing memory's content and embedding.
    pub async fn update(
        &self,
        id: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<(), MemoryError> {
        let result = sqlx::query(
            "UPDATE memories SET content = ?1, embedding = ?2, updated_at = ?3 WHERE id = ?4 AND deleted = 0",
        )
        .bind(content)
        .bind(encode_embedding(embedding))
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("failed to update memory: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::NotFound(id.to_string()));
        }

        debug!("Updated memory {id}: {}", truncate_for_log(content, 60));
        Ok(())
    }

    /// Soft-delete a memory by id.
    pub async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        sqlx::query("UPDATE memories SET deleted = 1, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("failed to delete memory: {e}")))?;

        debug!("Deleted memory {id}");
        Ok(())
    }

    /// Find the top-K most similar memories for a query embedding.
    ///
    /// Linear scan over the user's non-deleted rows; results are filtered by
    /// `min_score`, ordered by similarity descending with ties broken by most
    /// recent `updated_at`. Access counts of returned hits are incremented
    /// asynchronously (best-effort).
    pub async fn search(
        &self,
        query_embedding: &[f32],
        user_id: &str,
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, content, category, embedding, score, created_at, updated_at, access_cnt
            FROM memories WHERE user_id = ?1 AND deleted = 0 AND embedding IS NOT NULL
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("failed to query memories: {e}")))?;

        let mut results: Vec<SearchResult> = rows
            .iter()
            .filter_map(|row| Self::row_to_item(row).ok())
            .filter_map(|item| {
                let similarity = cosine_similarity(query_embedding, &item.embedding);
                (similarity >= min_score).then_some(SearchResult { item, similarity })
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.item.updated_at.cmp(&a.item.updated_at))
        });
        results.truncate(top_k);

        // Best-effort access bump; advisory only, may race a concurrent prune.
        for r in &results {
            let pool = self.pool.clone();
            let id = r.item.id.clone();
            tokio::spawn(async move {
                let _ = sqlx::query("UPDATE memories SET access_cnt = access_cnt + 1 WHERE id = ?1")
                    .bind(&id)
                    .execute(&pool)
                    .await;
            });
        }

        Ok(results)
    }

    /// All active memories for a user, most recently updated first.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Vec<MemoryItem>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, content, category, embedding, score, created_at, updated_at, access_cnt
            FROM memories WHERE user_id = ?1 AND deleted = 0
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("failed to get memories: {e}")))?;

        Ok(rows.iter().filter_map(|r| Self::row_to_item(r).ok()).collect())
    }

    /// Per-category counts for a user.
    pub async fn get_stats(&self, user_id: &str) -> Result<MemoryStats, MemoryError> {
        let rows = sqlx::query(
            "SELECT category, COUNT(*) as cnt FROM memories WHERE user_id = ?1 AND deleted = 0 GROUP BY category",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("failed to get stats: {e}")))?;

        let mut stats = MemoryStats {
            user_id: user_id.to_string(),
            ..MemoryStats::default()
        };
        for row in rows {
            let category: String = row.try_get("category").unwrap_or_default();
            let count: i64 = row.try_get("cnt").unwrap_or(0);
            stats.total_count += count as usize;
            stats.categories.insert(category, count as usize);
        }
        Ok(stats)
    }

    /// Soft-delete the lowest-value memories until the user is back under
    /// `max_items`. Value = `score * (1 + 0.1 * access_cnt)`. Returns the
    /// number pruned.
    pub async fn prune(&self, user_id: &str, max_items: usize) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM memories WHERE user_id = ?1 AND deleted = 0")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("prune count: {e}")))?;
        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| MemoryError::QueryFailed(format!("cnt column: {e}")))?;

        if count as usize <= max_items {
            return Ok(0);
        }

        let to_delete = count as usize - max_items;
        let result = sqlx::query(
            r#"
            UPDATE memories SET deleted = 1, updated_at = ?1
            WHERE id IN (
                SELECT id FROM memories
                WHERE user_id = ?2 AND deleted = 0
                ORDER BY (score * (1 + 0.1 * access_cnt)) ASC
                LIMIT ?3
            )
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .bind(to_delete as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("prune failed: {e}")))?;

        let pruned = result.rows_affected() as usize;
        if pruned > 0 {
            info!("Pruned {pruned} low-value memories for user {user_id}");
        }
        Ok(pruned)
    }

    fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryItem, MemoryError> {
        let parse_ts = |s: String| -> DateTime<Utc> {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| {
                    warn!("Unparseable timestamp in memories row: {s}");
                    Utc::now()
                })
        };

        let embedding: Vec<u8> = row.try_get("embedding").unwrap_or_default();
        Ok(MemoryItem {
            id: row
                .try_get("id")
                .map_err(|e| MemoryError::QueryFailed(format!("id column: {e}")))?,
            user_id: row
                .try_get("user_id")
                .map_err(|e| MemoryError::QueryFailed(format!("user_id column: {e}")))?,
            content: row
                .try_get("content")
                .map_err(|e| MemoryError::QueryFailed(format!("content column: {e}")))?,
            category: row.try_get("category").unwrap_or_else(|_| "fact".into()),
            embedding: decode_embedding(&embedding),
            score: row.try_get("score").unwrap_or(0.5),
            created_at: parse_ts(row.try_get("created_at").unwrap_or_default()),
            updated_at: parse_ts(row.try_get("updated_at").unwrap_or_default()),
            access_count: row.try_get("access_cnt").unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> MemoryStore {
        MemoryStore::new("sqlite::memory:").await.unwrap()
    }

    fn item(user: &str, content: &str, embedding: Vec<f32>) -> MemoryItem {
        MemoryItem {
            embedding,
            ..MemoryItem::new(user, content)
        }
    }

    #[tokio::test]
    async fn add_and_search_identity() {
        let store = test_store().await;
        let emb = vec![0.6f32, 0.8, 0.0];
        let mut m = item("u1", "User likes coffee", emb.clone());
        store.add(&mut m).await.unwrap();

        let results = store.search(&emb, "u1", 1, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.id, m.id);
        assert!(results[0].similarity >= 0.95);
    }

    #[tokio::test]
    async fn partition_isolation() {
        let store = test_store().await;
        let emb = vec![1.0f32, 0.0];
        let mut m1 = item("u1", "u1 fact", emb.clone());
        let mut m2 = item("u2", "u2 fact", emb.clone());
        store.add(&mut m1).await.unwrap();
        store.add(&mut m2).await.unwrap();

        let results = store.search(&emb, "u1", 10, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.user_id, "u1");
    }

    #[tokio::test]
    async fn search_respects_min_score_and_top_k() {
        let store = test_store().await;
        let mut a = item("u1", "aligned", vec![1.0, 0.0]);
        let mut b = item("u1", "orthogonal", vec![0.0, 1.0]);
        let mut c = item("u1", "close", vec![0.9, 0.1]);
        store.add(&mut a).await.unwrap();
        store.add(&mut b).await.unwrap();
        store.add(&mut c).await.unwrap();

        let results = store.search(&[1.0, 0.0], "u1", 10, 0.5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].item.content, "aligned");

        let capped = store.search(&[1.0, 0.0], "u1", 1, 0.0).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_hides_from_search() {
        let store = test_store().await;
        let emb = vec![1.0f32, 0.0];
        let mut m = item("u1", "to delete", emb.clone());
        store.add(&mut m).await.unwrap();
        store.delete(&m.id).await.unwrap();

        let results = store.search(&emb, "u1", 10, 0.0).await.unwrap();
        assert!(results.is_empty());
        assert!(store.get_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_replaces_content_and_embedding() {
        let store = test_store().await;
        let mut m = item("u1", "User likes coffee.", vec![1.0, 0.0]);
        store.add(&mut m).await.unwrap();

        store
            .update(&m.id, "User prefers black coffee without sugar", &[0.0, 1.0])
            .await
            .unwrap();

        let items = store.get_by_user("u1").await.unwrap();
        assert_eq!(items[0].content, "User prefers black coffee without sugar");
        assert_eq!(items[0].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn update_missing_id_is_not_found() {
        let store = test_store().await;
        let err = store.update("no-such-id", "x", &[1.0]).await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn prune_removes_lowest_value_first() {
        let store = test_store().await;
        for (content, score) in [("low", 0.1), ("mid", 0.5), ("high", 0.9)] {
            let mut m = item("u1", content, vec![1.0]);
            m.score = score;
            store.add(&mut m).await.unwrap();
        }

        let pruned = store.prune("u1", 2).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining = store.get_by_user("u1").await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|m| m.content != "low"));
    }

    #[tokio::test]
    async fn prune_noop_under_limit() {
        let store = test_store().await;
        let mut m = item("u1", "only one", vec![1.0]);
        store.add(&mut m).await.unwrap();
        assert_eq!(store.prune("u1", 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prune_value_weighs_access_count() {
        let store = test_store().await;
        // Same base score; frequently accessed one should survive.
        let mut cold = item("u1", "cold", vec![1.0]);
        cold.score = 0.5;
        let mut hot = item("u1", "hot", vec![1.0]);
        hot.score = 0.5;
        hot.access_count = 10; // value 0.5 * 2.0 = 1.0 vs 0.5
        store.add(&mut cold).await.unwrap();
        store.add(&mut hot).await.unwrap();

        store.prune("u1", 1).await.unwrap();
        let remaining = store.get_by_user("u1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "hot");
    }

    #[tokio::test]
    async fn stats_count_by_category() {
        let store = test_store().await;
        for (content, cat) in [
            ("likes coffee", "preference"),
            ("lives in Hanoi", "fact"),
            ("learning Rust", "fact"),
        ] {
            let mut m = item("u1", content, vec![1.0]);
            m.category = cat.into();
            store.add(&mut m).await.unwrap();
        }

        let stats = store.get_stats("u1").await.unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.categories["fact"], 2);
        assert_eq!(stats.categories["preference"], 1);
    }

    #[tokio::test]
    async fn embedding_blob_round_trip_through_db() {
        let store = test_store().await;
        let emb = vec![0.1f32, -2.5, 1e-7, 42.0];
        let mut m = item("u1", "embedded", emb.clone());
        store.add(&mut m).await.unwrap();

        let items = store.get_by_user("u1").await.unwrap();
        assert_eq!(items[0].embedding.len(), emb.len());
        for (a, b) in emb.iter().zip(items[0].embedding.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[tokio::test]
    async fn tie_break_prefers_recently_updated() {
        let store = test_store().await;
        let emb = vec![1.0f32, 0.0];
        let mut a = item("u1", "first", emb.clone());
        let mut b = item("u1", "second", emb.clone());
        store.add(&mut a).await.unwrap();
        store.add(&mut b).await.unwrap();
        // Touch "first" so its updated_at is strictly newest.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.update(&a.id, "first (edited)", &emb).await.unwrap();

        let results = store.search(&emb, "u1", 2, 0.0).await.unwrap();
        assert_eq!(results[0].item.content, "first (edited)");
    }
}
