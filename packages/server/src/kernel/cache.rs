//! Semantic cache for research results.
//!
//! Two tiers, probed in order: exact fingerprint match, then
//! nearest-neighbor over the stored fingerprints' query embeddings with
//! cosine similarity at or above a configured threshold. Eviction is LRU
//! with a size cap; expired entries are removed lazily on lookup.
//!
//! The cache itself is purely in-memory behind a single mutex; the kernel
//! write-throughs entries to the knowledge base's `cache_entries` table and
//! warm-loads them at startup.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::embedding::cosine_similarity;

/// The cached value: the persisted report and its final text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedReport {
    pub report_id: String,
    pub content: String,
}

/// One stored entry, keyed by parameter fingerprint.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub query_embedding: Vec<f32>,
    pub value: CachedReport,
    pub inserted_at: DateTime<Utc>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// LRU order: front = oldest, back = most recently used.
    order: VecDeque<String>,
}

/// Mutex-guarded two-tier semantic cache.
pub struct SemanticCache {
    inner: Mutex<CacheInner>,
    similarity_threshold: f32,
    capacity: usize,
    ttl: Duration,
}

impl SemanticCache {
    pub fn new(similarity_threshold: f32, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            similarity_threshold,
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Tier 1: exact fingerprint match.
    pub fn lookup_exact(&self, key: &str) -> Option<CachedReport> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.prune_expired(&mut inner);

        if inner.entries.contains_key(key) {
            Self::touch(&mut inner, key);
            return inner.entries.get(key).map(|e| e.value.clone());
        }
        None
    }

    /// Tier 2: nearest neighbor over stored query embeddings. Returns the
    /// best entry at or above the similarity threshold.
    pub fn lookup_similar(&self, query_embedding: &[f32]) -> Option<(CachedReport, f32)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.prune_expired(&mut inner);

        let mut best: Option<(String, f32)> = None;
        for entry in inner.entries.values() {
            let similarity = cosine_similarity(query_embedding, &entry.query_embedding);
            if similarity >= self.similarity_threshold {
                match &best {
                    Some((_, current)) if *current >= similarity => {}
                    _ => best = Some((entry.key.clone(), similarity)),
                }
            }
        }

        let (key, similarity) = best?;
        Self::touch(&mut inner, &key);
        let value = inner.entries.get(&key)?.value.clone();
        Some((value, similarity))
    }

    /// Insert an entry, evicting least-recently-used entries over capacity.
    /// Returns the evicted keys so the caller can drop their persisted rows.
    pub fn insert(
        &self,
        key: String,
        query_embedding: Vec<f32>,
        value: CachedReport,
    ) -> Vec<String> {
        let entry = CacheEntry {
            key: key.clone(),
            query_embedding,
            value,
            inserted_at: Utc::now(),
        };
        self.insert_entry(entry);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut evicted = Vec::new();
        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                if oldest != key {
                    evicted.push(oldest);
                }
            } else {
                break;
            }
        }
        evicted
    }

    /// Seed an entry without LRU bookkeeping side effects (startup warm-load).
    pub fn insert_entry(&self, entry: CacheEntry) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = entry.key.clone();
        inner.order.retain(|k| k != &key);
        inner.order.push_back(key.clone());
        inner.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(inner: &mut CacheInner, key: &str) {
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.to_string());
    }

    fn prune_expired(&self, inner: &mut CacheInner) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(24));
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.inserted_at < cutoff)
            .map(|e| e.key.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
            inner.order.retain(|k| k != &key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(id: &str) -> CachedReport {
        CachedReport {
            report_id: id.to_string(),
            content: format!("report {}", id),
        }
    }

    fn cache() -> SemanticCache {
        SemanticCache::new(0.85, 4, Duration::from_secs(3600))
    }

    #[test]
    fn exact_hit_after_insert() {
        let cache = cache();
        cache.insert("fp-1".into(), vec![1.0, 0.0], cached("r1"));

        let hit = cache.lookup_exact("fp-1").unwrap();
        assert_eq!(hit.report_id, "r1");
        assert!(cache.lookup_exact("fp-2").is_none());
    }

    #[test]
    fn similar_hit_above_threshold() {
        let cache = cache();
        cache.insert("fp-1".into(), vec![1.0, 0.0, 0.0], cached("r1"));

        let (hit, similarity) = cache.lookup_similar(&[0.99, 0.05, 0.0]).unwrap();
        assert_eq!(hit.report_id, "r1");
        assert!(similarity >= 0.85);
    }

    #[test]
    fn dissimilar_queries_miss() {
        let cache = cache();
        cache.insert("fp-1".into(), vec![1.0, 0.0, 0.0], cached("r1"));

        assert!(cache.lookup_similar(&[0.0, 1.0, 0.0]).is_none());
    }

    #[test]
    fn nearest_neighbor_wins() {
        let cache = cache();
        cache.insert("fp-a".into(), vec![1.0, 0.1], cached("ra"));
        cache.insert("fp-b".into(), vec![1.0, 0.0], cached("rb"));

        let (hit, _) = cache.lookup_similar(&[1.0, 0.0]).unwrap();
        assert_eq!(hit.report_id, "rb");
    }

    #[test]
    fn lru_eviction_over_capacity() {
        let cache = SemanticCache::new(0.85, 2, Duration::from_secs(3600));
        cache.insert("a".into(), vec![1.0], cached("ra"));
        cache.insert("b".into(), vec![1.0], cached("rb"));

        // Touch "a" so "b" becomes the LRU victim.
        cache.lookup_exact("a");
        let evicted = cache.insert("c".into(), vec![1.0], cached("rc"));

        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(cache.lookup_exact("a").is_some());
        assert!(cache.lookup_exact("b").is_none());
        assert!(cache.lookup_exact("c").is_some());
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = SemanticCache::new(0.85, 4, Duration::from_secs(0));
        cache.insert("fp-1".into(), vec![1.0], cached("r1"));

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.lookup_exact("fp-1").is_none());
        assert!(cache.is_empty());
    }
}
