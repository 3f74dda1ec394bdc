//! The engine context.
//!
//! [`Engine`] is the single explicit handle that owns every long-lived
//! component: the relational store, the index registry, the tag signal
//! engine, the planner, the caches, the embedding provider and the optional
//! re-ranker. It is cheap to clone; clones share state.
//!
//! # Lifecycle
//!
//! ```text
//! Engine::open
//!   ├─ validate config, check embedder dimensions (fatal on mismatch)
//!   ├─ connect + migrate SQLite
//!   ├─ open registry (load or recover tag index), preload corpus indices
//!   ├─ build tag signals (catalog, axes, co-occurrence)
//!   └─ start cache sweeper
//!
//! Engine::shutdown
//!   ├─ stop background tasks (watchers, sweeper, refreshes)
//!   ├─ flush pending index saves
//!   └─ close the store
//! ```

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{hash_str, CacheLayer, CacheStats};
use crate::config::{validate, Config};
use crate::db;
use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{EngineError, EngineResult};
use crate::index::IndexFactory;
use crate::ingest::IngestionPipeline;
use crate::migrate;
use crate::models::{KvEntry, SearchHit, StoredChunk};
use crate::planner::QueryPlanner;
use crate::registry::{read_index, IndexRegistry};
use crate::rerank::{HttpReranker, RerankProvider, Reranker};
use crate::retrieval::deduplicate_hits;
use crate::signals::{BoostRequest, SignalAnalysis, TagBoost, TagMatch, TagSignalEngine};
use crate::store::{RelationalStore, StoreStats};
use crate::vector::normalized;

/// A similarity search against one corpus or all of them.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// `None` searches every known corpus.
    pub corpus: Option<String>,
    pub vector: Vec<f32>,
    pub k: usize,
    /// Tag boost blend weight. `None` or zero disables boosting.
    pub tag_weight: Option<f32>,
    pub core_tags: Vec<String>,
    pub core_boost_factor: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub corpus: String,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub store: StoreStats,
    pub indices: Vec<IndexStats>,
    pub tag_index: usize,
    pub tags_loaded: usize,
    pub pending_saves: usize,
    pub cache: CacheStats,
}

struct EngineInner {
    config: Config,
    store: RelationalStore,
    registry: IndexRegistry,
    signals: TagSignalEngine,
    planner: QueryPlanner,
    cache: Arc<CacheLayer>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Reranker>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the engine with the re-ranker described by `config.rerank`.
    pub async fn open(
        config: Config,
        factory: Arc<dyn IndexFactory>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        Self::open_with(config, factory, embedder, None).await
    }

    /// Open the engine with an explicit re-rank provider, which takes
    /// precedence over `config.rerank.url`.
    pub async fn open_with(
        config: Config,
        factory: Arc<dyn IndexFactory>,
        embedder: Arc<dyn EmbeddingProvider>,
        rerank: Option<Arc<dyn RerankProvider>>,
    ) -> Result<Self> {
        validate(&config)?;

        let dims = config.embedding.dims.unwrap_or_else(|| embedder.dims());
        if embedder.dims() != dims {
            bail!(EngineError::DimensionMismatch {
                expected: dims,
                actual: embedder.dims(),
            });
        }

        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let store = RelationalStore::new(pool);

        let registry = IndexRegistry::open(store.clone(), factory, &config.index, dims)?;
        let corpora = store.corpora().await?;
        for corpus in &corpora {
            registry.get_or_create(corpus).await;
        }

        let signals = TagSignalEngine::new(config.tags.clone(), registry.clone(), store.clone());
        signals.refresh().await?;

        let cache = Arc::new(CacheLayer::new(&config.cache));
        let sweeper = cache
            .clone()
            .spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs.max(1)));

        let reranker = match rerank {
            Some(provider) => Some(Reranker::new(provider, config.rerank.max_tokens)),
            None if config.rerank.enabled => Some(Reranker::new(
                Arc::new(HttpReranker::new(&config.rerank)?),
                config.rerank.max_tokens,
            )),
            None => None,
        };

        info!(
            dims,
            model = embedder.model_name(),
            corpora = corpora.len(),
            tags = signals.tag_count(),
            rerank = reranker.is_some(),
            "Engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                planner: QueryPlanner::new(config.planner.clone()),
                config,
                store,
                registry,
                signals,
                cache,
                embedder,
                reranker,
                background: Mutex::new(vec![sweeper]),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &RelationalStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.inner.registry
    }

    pub fn signals(&self) -> &TagSignalEngine {
        &self.inner.signals
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.inner.planner
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.inner.cache
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.inner.embedder
    }

    pub fn reranker(&self) -> Option<&Reranker> {
        self.inner.reranker.as_ref()
    }

    pub fn dims(&self) -> usize {
        self.inner.registry.dims()
    }

    /// A new ingestion pipeline bound to this engine.
    pub fn ingestion_pipeline(&self) -> Result<Arc<IngestionPipeline>> {
        Ok(Arc::new(IngestionPipeline::new(self.clone())?))
    }

    /// Keep `handle` alive until shutdown, which aborts it.
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Wait for background index recoveries started so far.
    pub async fn settle(&self) {
        self.inner.registry.settle().await;
    }

    /// Called after every committed store change: cached query results are
    /// stale, and the tag catalog and co-occurrence matrix are rebuilt in
    /// the background.
    pub(crate) fn after_commit(&self) {
        self.inner.cache.invalidate_queries();
        let engine = self.clone();
        self.track(tokio::spawn(async move {
            if let Err(e) = engine.inner.signals.refresh().await {
                warn!(error = %e, "Tag signal refresh failed");
            }
        }));
    }

    /// Rebuild tag signals now.
    pub async fn refresh_signals(&self) -> EngineResult<()> {
        self.inner.signals.refresh().await
    }

    fn check_dims(&self, vector: &[f32]) -> EngineResult<()> {
        let expected = self.dims();
        if vector.len() != expected {
            let err = EngineError::DimensionMismatch {
                expected,
                actual: vector.len(),
            };
            warn!(error = %err, "Rejected query vector");
            return Err(err);
        }
        Ok(())
    }

    /// Nearest chunks to `request.vector`, optionally tag-boosted.
    ///
    /// Hits whose chunk row vanished between index search and hydration are
    /// dropped silently.
    pub async fn search(&self, request: &SearchRequest) -> EngineResult<Vec<SearchHit>> {
        self.check_dims(&request.vector)?;
        if request.k == 0 {
            return Ok(Vec::new());
        }

        let (query, info) = match request.tag_weight {
            Some(weight) if weight > 0.0 => {
                let boost = self
                    .inner
                    .signals
                    .apply_tag_boost(&BoostRequest {
                        vector: request.vector.clone(),
                        weight,
                        core_tags: request.core_tags.clone(),
                        core_boost_factor: request.core_boost_factor,
                    })
                    .await?;
                (boost.vector, Some(boost.info))
            }
            _ => (normalized(&request.vector), None),
        };

        let corpora = match &request.corpus {
            Some(corpus) => vec![corpus.clone()],
            None => self.inner.store.corpora().await?,
        };

        let mut raw = Vec::new();
        for corpus in &corpora {
            raw.extend(self.inner.registry.search(corpus, &query, request.k).await?);
        }
        raw.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        raw.truncate(request.k);
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = raw.iter().map(|h| h.id).collect();
        let mut chunks = self.inner.store.hydrate_chunks(&ids).await?;
        let mut hits: Vec<SearchHit> = raw
            .iter()
            .filter_map(|h| chunks.remove(&h.id).map(|c| SearchHit::from_chunk(c, h.score)))
            .collect();
        if hits.len() < raw.len() {
            debug!(dropped = raw.len() - hits.len(), "Dropped hits without store rows");
        }

        if let Some(info) = info {
            let chunk_tags = self.inner.store.tags_for_chunks(&ids).await?;
            let weights = info.relative_weights();
            let core: HashSet<&str> = info.core_tags_matched.iter().map(String::as_str).collect();
            for hit in &mut hits {
                let tags = chunk_tags.get(&hit.chunk_id).map(Vec::as_slice).unwrap_or(&[]);
                hit.matched_tags = tags
                    .iter()
                    .filter(|t| weights.contains_key(t.as_str()))
                    .cloned()
                    .collect();
                hit.core_tags_matched = tags
                    .iter()
                    .filter(|t| core.contains(t.as_str()))
                    .cloned()
                    .collect();
                hit.tag_match_score = hit
                    .matched_tags
                    .iter()
                    .filter_map(|t| weights.get(t.as_str()))
                    .sum();
                hit.tag_match_count = hit.matched_tags.len();
                hit.boost_factor = info.boost_factor;
            }
        }

        Ok(hits)
    }

    pub async fn apply_tag_boost(&self, request: &BoostRequest) -> EngineResult<TagBoost> {
        self.inner.signals.apply_tag_boost(request).await
    }

    pub fn get_signal_analysis(&self, vector: &[f32]) -> EngineResult<SignalAnalysis> {
        self.inner.signals.analyze(vector)
    }

    /// Drop near-duplicate candidates, best first.
    pub fn deduplicate(&self, candidates: Vec<SearchHit>, query: &[f32]) -> Vec<SearchHit> {
        deduplicate_hits(candidates, query, self.inner.config.retrieval.dedup_threshold)
    }

    pub async fn get_chunks_by_file_paths(&self, paths: &[String]) -> EngineResult<Vec<StoredChunk>> {
        Ok(self.inner.store.chunks_by_file_paths(paths).await?)
    }

    /// Vector stored in the key/vector table under `key`.
    pub async fn get_vector_for_key(&self, key: &str) -> EngineResult<Option<Vec<f32>>> {
        let dims = self.dims();
        Ok(self
            .inner
            .store
            .kv_get(key)
            .await?
            .and_then(|entry| entry.vector)
            .filter(|v| v.len() == dims))
    }

    /// Vector for `text`, stored under the sha256 of the text. Embeds and
    /// persists on first use; `None` if the text cannot be embedded.
    pub async fn get_or_embed_keyed(&self, text: &str) -> EngineResult<Option<Vec<f32>>> {
        let key = hash_str(text);
        if let Some(vector) = self.get_vector_for_key(&key).await? {
            return Ok(Some(vector));
        }
        let Some(vector) = embed_one(self.inner.embedder.as_ref(), text).await else {
            return Ok(None);
        };
        self.inner
            .store
            .kv_put(&KvEntry {
                key,
                value: None,
                vector: Some(vector.clone()),
            })
            .await?;
        Ok(Some(vector))
    }

    pub fn search_similar_tags(&self, vector: &[f32], k: usize) -> EngineResult<Vec<TagMatch>> {
        self.inner.signals.search_similar_tags(vector, k)
    }

    /// Embed query text through the embedding cache.
    pub async fn embed_query(&self, text: &str) -> EngineResult<Vec<f32>> {
        if let Some(vector) = self.inner.cache.get_embedding(text) {
            return Ok(vector.to_vec());
        }
        let vector = embed_one(self.inner.embedder.as_ref(), text)
            .await
            .ok_or_else(|| EngineError::Provider("query text produced no embedding".to_string()))?;
        self.inner.cache.put_embedding(text, vector.clone());
        Ok(vector)
    }

    /// Representative vector of a corpus: the embedded corpus name, looked
    /// up in the derived cache, then the key/vector table, then embedded
    /// and persisted.
    pub async fn corpus_vector(&self, corpus: &str) -> EngineResult<Option<Vec<f32>>> {
        let key = format!("corpus_name:{}", corpus);
        if let Some(vector) = self.inner.cache.get_derived(&key) {
            return Ok(Some(vector.to_vec()));
        }
        if let Some(vector) = self.get_vector_for_key(&key).await? {
            self.inner.cache.put_derived(key, vector.clone());
            return Ok(Some(vector));
        }

        let Some(vector) = embed_one(self.inner.embedder.as_ref(), corpus).await else {
            return Ok(None);
        };
        self.inner
            .store
            .kv_put(&KvEntry {
                key: key.clone(),
                value: Some(corpus.to_string()),
                vector: Some(vector.clone()),
            })
            .await?;
        self.inner.cache.put_derived(key, vector.clone());
        Ok(Some(vector))
    }

    pub async fn stats(&self) -> EngineResult<EngineStats> {
        let registry = &self.inner.registry;
        let store = self.inner.store.stats().await?;
        let indices = registry
            .loaded()
            .await
            .into_iter()
            .map(|(corpus, entries)| IndexStats { corpus, entries })
            .collect();
        let tag_index = {
            let tags = registry.tag_index();
            let len = read_index(&tags).len();
            len
        };
        Ok(EngineStats {
            store,
            indices,
            tag_index,
            tags_loaded: self.inner.signals.tag_count(),
            pending_saves: registry.pending_saves(),
            cache: self.inner.cache.stats(),
        })
    }

    /// Stop background work, persist dirty indices and close the store.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }

        let pending = self.inner.registry.pending_saves();
        self.inner.registry.flush_all();
        self.inner.registry.cancel_background();
        self.inner.store.close().await;
        info!(flushed = pending, "Engine shut down");
    }
}
