//! Research report storage.
//!
//! Reports are immutable except for the rating fields; every report is
//! indexed into `doc_index` in the same transaction that inserts it, so no
//! report exists without index entries and no orphan entries exist without
//! their report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::embedding::{cosine_similarity, embedding_from_bytes, embedding_to_bytes};
use crate::common::error::{ResearchError, Result};

use super::doc_index::DocIndexEntry;
use super::KnowledgeBase;

/// A persisted research report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub query: String,
    pub parameters: serde_json::Value,
    pub content: String,
    pub metadata: serde_json::Value,
    pub based_on_report_ids: Vec<String>,
    pub rating: Option<i64>,
    pub rating_comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a report.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub query: String,
    pub parameters: serde_json::Value,
    pub content: String,
    pub metadata: serde_json::Value,
    pub based_on_report_ids: Vec<String>,
}

#[derive(Debug, FromRow)]
struct ReportRow {
    id: String,
    query: String,
    parameters: String,
    content: String,
    metadata: String,
    based_on_report_ids: String,
    rating: Option<i64>,
    rating_comment: Option<String>,
    created_at: String,
}

impl ReportRow {
    fn into_report(self) -> Result<Report> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| ResearchError::StoragePermanent(format!("invalid date: {}", e)))?
            .with_timezone(&Utc);

        Ok(Report {
            id: self.id,
            query: self.query,
            parameters: serde_json::from_str(&self.parameters).unwrap_or_default(),
            content: self.content,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
            based_on_report_ids: serde_json::from_str(&self.based_on_report_ids)
                .unwrap_or_default(),
            rating: self.rating,
            rating_comment: self.rating_comment,
            created_at,
        })
    }
}

const REPORT_COLUMNS: &str = "id, query, parameters, content, metadata, based_on_report_ids, \
                              rating, rating_comment, created_at";

impl KnowledgeBase {
    /// Insert a report and its index entries in one transaction.
    /// Returns the new report id.
    pub async fn save_report(
        &self,
        report: NewReport,
        index_entries: Vec<DocIndexEntry>,
    ) -> Result<String> {
        let report_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO research_reports
                (id, query, parameters, content, metadata, based_on_report_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report_id)
        .bind(&report.query)
        .bind(serde_json::to_string(&report.parameters)?)
        .bind(&report.content)
        .bind(serde_json::to_string(&report.metadata)?)
        .bind(serde_json::to_string(&report.based_on_report_ids)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for entry in &index_entries {
            let entry_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO doc_index (id, source_type, source_id, title, content, embedding, tokens)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry_id)
            .bind(&entry.source_type)
            .bind(&report_id)
            .bind(&entry.title)
            .bind(&entry.content)
            .bind(entry.embedding.as_ref().map(|e| embedding_to_bytes(e)))
            .bind(entry.content.split_whitespace().count() as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO doc_index_fts (id, title, content) VALUES (?, ?, ?)")
                .bind(&entry_id)
                .bind(entry.title.as_deref().unwrap_or_default())
                .bind(&entry.content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(report_id)
    }

    /// Fetch a single report.
    pub async fn get_report(&self, report_id: &str) -> Result<Option<Report>> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {} FROM research_reports WHERE id = ?",
            REPORT_COLUMNS
        ))
        .bind(report_id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(r) => Ok(Some(r.into_report()?)),
            None => Ok(None),
        }
    }

    /// Most recent reports, newest first.
    pub async fn list_recent_reports(&self, limit: i64) -> Result<Vec<Report>> {
        let rows = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {} FROM research_reports ORDER BY created_at DESC LIMIT ?",
            REPORT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(|r| r.into_report()).collect()
    }

    /// Attach a rating (1-5) and optional comment to a report.
    pub async fn add_feedback_to_report(
        &self,
        report_id: &str,
        rating: i64,
        comment: Option<&str>,
    ) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(ResearchError::Validation(
                "rating must be between 1 and 5".into(),
            ));
        }

        let updated = sqlx::query(
            "UPDATE research_reports SET rating = ?, rating_comment = ? WHERE id = ?",
        )
        .bind(rating)
        .bind(comment)
        .bind(report_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ResearchError::NotFound(format!("report {}", report_id)));
        }
        Ok(())
    }

    /// Find prior reports by embedding similarity.
    ///
    /// Every returned pair satisfies `similarity >= min_similarity`.
    pub async fn find_reports_by_similarity(
        &self,
        query_embedding: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(Report, f32)>> {
        let rows = sqlx::query_as::<_, (String, Option<Vec<u8>>)>(
            "SELECT source_id, embedding FROM doc_index \
             WHERE source_type = 'report' AND embedding IS NOT NULL",
        )
        .fetch_all(self.pool())
        .await?;

        // Best similarity per report; entries with a mismatched dimension
        // are skipped rather than failing the search.
        let mut best: std::collections::HashMap<String, f32> = std::collections::HashMap::new();
        for (source_id, embedding_bytes) in rows {
            let embedding = embedding_from_bytes(&embedding_bytes.unwrap_or_default());
            if embedding.len() != query_embedding.len() {
                continue;
            }
            let similarity = cosine_similarity(query_embedding, &embedding);
            let slot = best.entry(source_id).or_insert(f32::MIN);
            if similarity > *slot {
                *slot = similarity;
            }
        }

        let mut scored: Vec<(String, f32)> = best
            .into_iter()
            .filter(|(_, s)| *s >= min_similarity)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let mut results = Vec::with_capacity(scored.len());
        for (report_id, similarity) in scored {
            if let Some(report) = self.get_report(&report_id).await? {
                results.push((report, similarity));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_kb() -> KnowledgeBase {
        KnowledgeBase::in_memory(3, 0.7).await.unwrap()
    }

    fn sample_report(query: &str) -> NewReport {
        NewReport {
            query: query.to_string(),
            parameters: json!({"costPreference": "low"}),
            content: format!("Findings for {}", query),
            metadata: json!({"durationMs": 1200}),
            based_on_report_ids: vec![],
        }
    }

    fn report_entry(content: &str, embedding: Vec<f32>) -> DocIndexEntry {
        DocIndexEntry {
            source_type: "report".to_string(),
            title: Some("title".to_string()),
            content: content.to_string(),
            embedding: Some(embedding),
        }
    }

    #[tokio::test]
    async fn save_and_get_roundtrip() {
        let kb = test_kb().await;
        let id = kb
            .save_report(
                sample_report("rust async runtimes"),
                vec![report_entry("Findings about tokio", vec![1.0, 0.0, 0.0])],
            )
            .await
            .unwrap();

        let report = kb.get_report(&id).await.unwrap().unwrap();
        assert_eq!(report.query, "rust async runtimes");
        assert!(report.rating.is_none());
    }

    #[tokio::test]
    async fn missing_report_returns_none() {
        let kb = test_kb().await;
        assert!(kb.get_report("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn every_report_has_an_index_entry() {
        let kb = test_kb().await;
        let id = kb
            .save_report(
                sample_report("q"),
                vec![report_entry("content", vec![0.5, 0.5, 0.0])],
            )
            .await
            .unwrap();

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM doc_index WHERE source_type = 'report' AND source_id = ?",
        )
        .bind(&id)
        .fetch_one(kb.pool())
        .await
        .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn feedback_validates_range() {
        let kb = test_kb().await;
        let id = kb
            .save_report(sample_report("q"), vec![report_entry("c", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();

        assert!(kb.add_feedback_to_report(&id, 0, None).await.is_err());
        assert!(kb.add_feedback_to_report(&id, 6, None).await.is_err());

        kb.add_feedback_to_report(&id, 4, Some("useful")).await.unwrap();
        let report = kb.get_report(&id).await.unwrap().unwrap();
        assert_eq!(report.rating, Some(4));
        assert_eq!(report.rating_comment.as_deref(), Some("useful"));
    }

    #[tokio::test]
    async fn feedback_on_missing_report_is_not_found() {
        let kb = test_kb().await;
        let err = kb.add_feedback_to_report("missing", 3, None).await;
        assert!(matches!(err, Err(ResearchError::NotFound(_))));
    }

    #[tokio::test]
    async fn similarity_search_respects_floor_and_k() {
        let kb = test_kb().await;
        let close = kb
            .save_report(
                sample_report("close"),
                vec![report_entry("close", vec![1.0, 0.0, 0.0])],
            )
            .await
            .unwrap();
        let _far = kb
            .save_report(
                sample_report("far"),
                vec![report_entry("far", vec![0.0, 1.0, 0.0])],
            )
            .await
            .unwrap();

        let results = kb
            .find_reports_by_similarity(&[1.0, 0.0, 0.0], 3, 0.7)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, close);
        assert!(results[0].1 >= 0.7);
    }

    #[tokio::test]
    async fn list_recent_orders_newest_first() {
        let kb = test_kb().await;
        for i in 0..3 {
            kb.save_report(
                sample_report(&format!("q{}", i)),
                vec![report_entry("c", vec![1.0, 0.0, 0.0])],
            )
            .await
            .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let reports = kb.list_recent_reports(2).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].query, "q2");
    }
}
