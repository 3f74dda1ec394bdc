//! Three independent TTL + LRU caches.
//!
//! | Cache | Key | Value |
//! |-------|-----|-------|
//! | embeddings | sha256 of normalized text | query vector |
//! | queries | sha256 of corpus, text, modifiers, K (and the day, when time-sensitive) | ranked hits |
//! | derived | caller-chosen name | precomputed vectors (corpus representatives) |
//!
//! Expired entries are never returned; a background sweep reclaims them.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::models::SearchHit;

/// Inputs that identify a cached query result.
#[derive(Debug, Clone, Serialize)]
pub struct QueryKey<'a> {
    pub corpus: Option<&'a str>,
    pub text: &'a str,
    pub modifiers: &'a str,
    pub k: usize,
    /// Calendar day (`YYYY-MM-DD`) for time-sensitive queries.
    pub day: Option<String>,
    pub context: Option<&'a str>,
    pub core_tags: &'a [String],
    pub exclude_prefixes: &'a [String],
    /// [`vectors_digest`] of a caller-supplied query vector.
    pub vector: Option<String>,
    /// [`vectors_digest`] of the conversation turn vectors.
    pub context_vectors: Option<String>,
}

impl QueryKey<'_> {
    pub fn digest(&self) -> String {
        let normalized = serde_json::json!({
            "corpus": self.corpus,
            "text": self.text.trim(),
            "modifiers": self.modifiers,
            "k": self.k,
            "day": self.day,
            "context": self.context.map(str::trim),
            "core_tags": self.core_tags,
            "exclude_prefixes": self.exclude_prefixes,
            "vector": self.vector,
            "context_vectors": self.context_vectors,
        });
        hash_str(&normalized.to_string())
    }
}

/// Digest of a sequence of vectors, `None` when there are none.
pub fn vectors_digest<'v>(vectors: impl IntoIterator<Item = &'v [f32]>) -> Option<String> {
    let mut hasher = Sha256::new();
    let mut any = false;
    for vector in vectors {
        any = true;
        hasher.update((vector.len() as u64).to_le_bytes());
        for x in vector {
            hasher.update(x.to_le_bytes());
        }
    }
    any.then(|| hex::encode(hasher.finalize()))
}

pub fn hash_str(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn build<V: Clone + Send + Sync + 'static>(max: u64, ttl: Duration) -> Cache<String, V> {
    Cache::builder()
        .max_capacity(max)
        .time_to_live(ttl)
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub embeddings: u64,
    pub queries: u64,
    pub derived: u64,
}

pub struct CacheLayer {
    embeddings: Cache<String, Arc<Vec<f32>>>,
    queries: Cache<String, Arc<Vec<SearchHit>>>,
    derived: Cache<String, Arc<Vec<f32>>>,
}

impl CacheLayer {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            embeddings: build(
                config.embedding_max,
                Duration::from_secs(config.embedding_ttl_secs),
            ),
            queries: build(config.query_max, Duration::from_secs(config.query_ttl_secs)),
            derived: build(config.derived_max, Duration::from_secs(config.derived_ttl_secs)),
        }
    }

    /// Build with explicit TTLs; used where seconds are too coarse.
    pub fn with_ttls(max: u64, embedding: Duration, query: Duration, derived: Duration) -> Self {
        Self {
            embeddings: build(max, embedding),
            queries: build(max, query),
            derived: build(max, derived),
        }
    }

    pub fn get_embedding(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.embeddings.get(&hash_str(text.trim()))
    }

    pub fn put_embedding(&self, text: &str, vector: Vec<f32>) {
        self.embeddings.insert(hash_str(text.trim()), Arc::new(vector));
    }

    pub fn get_query(&self, key: &str) -> Option<Arc<Vec<SearchHit>>> {
        self.queries.get(key)
    }

    pub fn put_query(&self, key: String, hits: Vec<SearchHit>) {
        self.queries.insert(key, Arc::new(hits));
    }

    /// Drop all cached query results. Called after every committed
    /// ingestion batch.
    pub fn invalidate_queries(&self) {
        self.queries.invalidate_all();
    }

    pub fn get_derived(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        self.derived.get(key)
    }

    pub fn put_derived(&self, key: String, vector: Vec<f32>) {
        self.derived.insert(key, Arc::new(vector));
    }

    /// Reclaim expired and invalidated entries.
    pub fn sweep(&self) {
        self.embeddings.run_pending_tasks();
        self.queries.run_pending_tasks();
        self.derived.run_pending_tasks();
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            embeddings: self.embeddings.entry_count(),
            queries: self.queries.entry_count(),
            derived: self.derived.entry_count(),
        }
    }
}
