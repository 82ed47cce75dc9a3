//! Retrieval index and hybrid search.
//!
//! Lexical scores come from SQLite's FTS5 `bm25()` (Okapi BM25); vector
//! scores are cosine similarity over the stored embeddings. The two are
//! fused with fixed weights after normalizing BM25 per result set, since raw
//! BM25 is unbounded while cosine already lives in [0, 1].

use sqlx::Row;

use crate::common::embedding::{cosine_similarity, embedding_from_bytes};
use crate::common::error::Result;

use super::KnowledgeBase;

/// Input for one retrieval-index entry. The owning report id becomes the
/// entry's `source_id` at insert time.
#[derive(Debug, Clone)]
pub struct DocIndexEntry {
    /// "report" for synthesized reports, "document" for attached documents
    pub source_type: String,
    pub title: Option<String>,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
}

/// Which index entries a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    #[default]
    Both,
    Reports,
    Docs,
}

impl SearchScope {
    fn matches(&self, source_type: &str) -> bool {
        match self {
            SearchScope::Both => true,
            SearchScope::Reports => source_type == "report",
            SearchScope::Docs => source_type != "report",
        }
    }
}

/// One hybrid-search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry_id: String,
    pub source_type: String,
    pub source_id: String,
    pub title: Option<String>,
    pub snippet: String,
    pub score: f32,
}

#[derive(Debug)]
struct IndexedRow {
    entry_id: String,
    source_type: String,
    source_id: String,
    title: Option<String>,
    content: String,
    embedding: Option<Vec<f32>>,
}

impl KnowledgeBase {
    /// Hybrid BM25 + vector search over the doc index.
    ///
    /// `query_embedding` is optional; without it the search degrades to
    /// BM25-only, which keeps `search` usable when the embedding provider is
    /// down.
    pub async fn search_hybrid(
        &self,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        k: usize,
        scope: SearchScope,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // Lexical candidates from FTS5. bm25() returns negative
        // better-is-lower scores; flip the sign so bigger is better.
        let mut bm25_scores: std::collections::HashMap<String, f32> =
            std::collections::HashMap::new();
        if let Some(match_expr) = fts_match_expression(query_text) {
            let rows = sqlx::query(
                "SELECT id, bm25(doc_index_fts) AS score \
                 FROM doc_index_fts WHERE doc_index_fts MATCH ? \
                 ORDER BY score LIMIT ?",
            )
            .bind(&match_expr)
            .bind((k * 8) as i64)
            .fetch_all(self.pool())
            .await
            .unwrap_or_default();

            for row in rows {
                let id: String = row.get("id");
                let score: f64 = row.get("score");
                bm25_scores.insert(id, (-score) as f32);
            }
        }

        let rows = self.load_index_rows(scope).await?;

        let max_bm25 = bm25_scores
            .values()
            .cloned()
            .fold(0.0f32, f32::max)
            .max(f32::EPSILON);
        let bm25_weight = self.bm25_weight();
        let vector_weight = 1.0 - bm25_weight;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .filter_map(|row| {
                let bm25_component = bm25_scores
                    .get(&row.entry_id)
                    .map(|s| (s / max_bm25).clamp(0.0, 1.0))
                    .unwrap_or(0.0);

                let vector_component = match (query_embedding, &row.embedding) {
                    (Some(query), Some(stored))
                        if query.len() == stored.len() && !stored.is_empty() =>
                    {
                        cosine_similarity(query, stored).clamp(0.0, 1.0)
                    }
                    _ => 0.0,
                };

                let score = bm25_weight * bm25_component + vector_weight * vector_component;
                if score <= 0.0 {
                    return None;
                }

                Some(SearchHit {
                    snippet: snippet_of(&row.content),
                    entry_id: row.entry_id,
                    source_type: row.source_type,
                    source_id: row.source_id,
                    title: row.title,
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn load_index_rows(&self, scope: SearchScope) -> Result<Vec<IndexedRow>> {
        let rows = sqlx::query(
            "SELECT id, source_type, source_id, title, content, embedding FROM doc_index",
        )
        .fetch_all(self.pool())
        .await?;

        let vector_dim = self.vector_dim();
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let source_type: String = row.get("source_type");
                if !scope.matches(&source_type) {
                    return None;
                }
                // Entries with a stale embedding dimension are ignored for
                // the vector component rather than failing the search.
                let embedding = row
                    .get::<Option<Vec<u8>>, _>("embedding")
                    .map(|bytes| embedding_from_bytes(&bytes))
                    .filter(|e| !e.is_empty() && e.len() == vector_dim);
                Some(IndexedRow {
                    entry_id: row.get("id"),
                    source_type,
                    source_id: row.get("source_id"),
                    title: row.get("title"),
                    content: row.get("content"),
                    embedding,
                })
            })
            .collect())
    }
}

/// Build an FTS5 MATCH expression from free text: quoted tokens, OR-joined.
fn fts_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn snippet_of(content: &str) -> String {
    const SNIPPET_LEN: usize = 280;
    if content.len() <= SNIPPET_LEN {
        content.to_string()
    } else {
        let mut end = SNIPPET_LEN;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &content[..end])
    }
}
