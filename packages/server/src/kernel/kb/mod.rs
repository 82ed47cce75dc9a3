//! Embedded knowledge base.
//!
//! A file-based SQLite store holding research reports, the retrieval index
//! (BM25 + vector), job state, the append-only job event log, and persisted
//! semantic-cache entries. Migrations are idempotent at startup; missing
//! columns are added non-destructively.
//!
//! If the store directory cannot be opened the KB falls back to an
//! in-memory database and surfaces a health flag; writes in that mode are
//! best-effort and do not survive restart.

pub mod doc_index;
pub mod report;

pub use doc_index::{DocIndexEntry, SearchHit, SearchScope};
pub use report::{NewReport, Report};

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{info, warn};

use crate::common::embedding::{embedding_from_bytes, embedding_to_bytes};
use crate::common::error::Result;
use crate::kernel::cache::{CacheEntry, CachedReport};

/// Embedded relational store with vector retrieval.
pub struct KnowledgeBase {
    pool: SqlitePool,
    durable: bool,
    vector_dim: usize,
    bm25_weight: f32,
}

impl KnowledgeBase {
    /// Open (or create) the store under the given directory. Falls back to
    /// an in-memory database when the directory or file cannot be opened.
    pub async fn open(kb_path: &str, vector_dim: usize, bm25_weight: f32) -> Result<Self> {
        match Self::open_durable(kb_path, vector_dim, bm25_weight).await {
            Ok(kb) => Ok(kb),
            Err(e) => {
                warn!(error = %e, path = %kb_path, "failed to open knowledge base, falling back to in-memory mode");
                let mut kb = Self::in_memory(vector_dim, bm25_weight).await?;
                kb.durable = false;
                Ok(kb)
            }
        }
    }

    async fn open_durable(kb_path: &str, vector_dim: usize, bm25_weight: f32) -> Result<Self> {
        std::fs::create_dir_all(kb_path)
            .map_err(|e| crate::common::error::ResearchError::StoragePermanent(e.to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(Path::new(kb_path).join("research.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let kb = Self {
            pool,
            durable: true,
            vector_dim,
            bm25_weight,
        };
        kb.run_migrations().await?;
        info!(path = %kb_path, "knowledge base opened");
        Ok(kb)
    }

    /// Create an in-memory store (tests, fallback mode).
    pub async fn in_memory(vector_dim: usize, bm25_weight: f32) -> Result<Self> {
        // A single connection keeps every query on the same in-memory
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let kb = Self {
            pool,
            durable: true,
            vector_dim,
            bm25_weight,
        };
        kb.run_migrations().await?;
        Ok(kb)
    }

    /// Whether writes land on disk. False in fallback mode.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn vector_dim(&self) -> usize {
        self.vector_dim
    }

    pub(crate) fn bm25_weight(&self) -> f32 {
        self.bm25_weight
    }

    /// Run idempotent migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS research_reports (
                id TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT '{}',
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                based_on_report_ids TEXT NOT NULL DEFAULT '[]',
                rating INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reports_created_at ON research_reports(created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS doc_index (
                id TEXT PRIMARY KEY,
                source_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                title TEXT,
                content TEXT NOT NULL,
                embedding BLOB,
                tokens INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_doc_index_source ON doc_index(source_type, source_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        // FTS5 table for BM25 keyword search over the doc index
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS doc_index_fts USING fts5(
                id UNINDEXED,
                title,
                content
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'queued',
                progress INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                lease_owner TEXT,
                lease_expires_at TEXT,
                heartbeat_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                idempotency_key TEXT,
                idempotency_expires_at TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_idempotency ON jobs(idempotency_key);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_events (
                job_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts TEXT NOT NULL,
                PRIMARY KEY (job_id, seq)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                query_embedding BLOB,
                value TEXT NOT NULL,
                inserted_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Columns introduced after the initial schema; added in place.
        self.ensure_column("research_reports", "rating_comment", "TEXT")
            .await?;
        self.ensure_column("jobs", "run_after", "TEXT").await?;
        self.ensure_column("jobs", "progress_token", "TEXT").await?;

        Ok(())
    }

    /// Add a column if it is missing. Never drops or rewrites data.
    async fn ensure_column(&self, table: &str, column: &str, decl: &str) -> Result<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&self.pool)
            .await?;

        let exists = rows
            .iter()
            .any(|row| row.get::<String, _>("name") == column);

        if !exists {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, decl
            ))
            .execute(&self.pool)
            .await?;
            info!(table, column, "added missing column");
        }

        Ok(())
    }

    // =========================================================================
    // Semantic-cache persistence
    // =========================================================================

    /// Write a cache entry through to storage.
    pub async fn persist_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, query_embedding, value, inserted_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                query_embedding = excluded.query_embedding,
                value = excluded.value,
                inserted_at = excluded.inserted_at
            "#,
        )
        .bind(&entry.key)
        .bind(embedding_to_bytes(&entry.query_embedding))
        .bind(serde_json::to_string(&entry.value)?)
        .bind(entry.inserted_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop persisted rows for evicted keys.
    pub async fn delete_cache_entries(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Load persisted cache entries for the startup warm-load.
    pub async fn load_cache_entries(&self, limit: i64) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT key, query_embedding, value, inserted_at
            FROM cache_entries
            ORDER BY inserted_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let value: CachedReport = match serde_json::from_str(&row.get::<String, _>("value")) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "skipping malformed cache entry");
                    continue;
                }
            };
            let inserted_at = chrono::DateTime::parse_from_rfc3339(&row.get::<String, _>("inserted_at"))
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now());
            entries.push(CacheEntry {
                key: row.get("key"),
                query_embedding: embedding_from_bytes(
                    &row.get::<Option<Vec<u8>>, _>("query_embedding").unwrap_or_default(),
                ),
                value,
                inserted_at,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn test_kb() -> KnowledgeBase {
        KnowledgeBase::in_memory(3, 0.7).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let kb = test_kb().await;
        // Running them again must not fail.
        kb.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_column_is_noop_when_present() {
        let kb = test_kb().await;
        kb.ensure_column("jobs", "run_after", "TEXT").await.unwrap();
        kb.ensure_column("jobs", "run_after", "TEXT").await.unwrap();
    }

    #[tokio::test]
    async fn cache_entries_roundtrip() {
        let kb = test_kb().await;
        let entry = CacheEntry {
            key: "fp-1".into(),
            query_embedding: vec![0.1, 0.2, 0.3],
            value: CachedReport {
                report_id: "r1".into(),
                content: "cached text".into(),
            },
            inserted_at: Utc::now(),
        };

        kb.persist_cache_entry(&entry).await.unwrap();
        let loaded = kb.load_cache_entries(10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "fp-1");
        assert_eq!(loaded[0].value.report_id, "r1");
        assert_eq!(loaded[0].query_embedding, vec![0.1, 0.2, 0.3]);

        kb.delete_cache_entries(&["fp-1".to_string()]).await.unwrap();
        assert!(kb.load_cache_entries(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_memory_mode_reports_durable() {
        let kb = test_kb().await;
        assert!(kb.is_durable());
    }
}
