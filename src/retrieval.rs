//! Retrieval orchestration.
//!
//! One [`RetrievalRequest`] goes through:
//!
//! ```text
//! embed query (cached) ─▶ signals ─▶ plan (K, tag weight, truncation)
//!        │
//!        ├─ query cache hit? ──▶ return
//!        │
//!        ├─ one corpus, no time range ─▶ standard
//!        ├─ one corpus, time range ────▶ time-aware
//!        └─ several corpora ──────────▶ aggregate (standard / time-aware per corpus)
//!        │
//!        └─ optional re-rank ─▶ truncate to K (every path) ─▶ query cache
//! ```
//!
//! **Standard** searches the live vector plus up to `max_history` context
//! segment vectors, each weighted `decay^distance`, deduplicates the union
//! and truncates (or re-ranks) to K.
//!
//! **Time-aware** splits K into a semantic share and a date share. The date
//! share ranks chunks dated inside the requested ranges by cosine similarity
//! to the query; both shares are unioned by text.
//!
//! **Aggregate** scores each corpus by the similarity of its representative
//! vector to the query, turns those into weights with a temperature softmax,
//! allocates K proportionally (with a per-corpus floor) and runs the
//! single-corpus path for every corpus in parallel.
//!
//! Retrieval modifiers arrive as a marker string such as
//! `::Time::Rerank::TagMemo0.3:1.5`.

use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{vectors_digest, QueryKey};
use crate::context::{ContextWindow, SEGMENT_THRESHOLD};
use crate::engine::{Engine, SearchRequest};
use crate::error::{EngineError, EngineResult};
use crate::models::{HitOrigin, SearchHit};
use crate::planner::{truncate_tags, QueryPlan};
use crate::time_range::{parse_time_ranges, today, TimeRange};
use crate::vector::{cosine_similarity, normalized};

/// Flags parsed from a `::Time::Rerank::TagMemo0.3:1.5` marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalModifiers {
    pub time: bool,
    pub rerank: bool,
    pub tag_memo: bool,
    /// Explicit tag weight from `TagMemo<w>`.
    pub tag_weight: Option<f32>,
    pub k_multiplier: f32,
}

impl Default for RetrievalModifiers {
    fn default() -> Self {
        Self {
            time: false,
            rerank: false,
            tag_memo: false,
            tag_weight: None,
            k_multiplier: 1.0,
        }
    }
}

impl RetrievalModifiers {
    pub fn parse(marker: &str) -> Self {
        let mut modifiers = Self::default();
        let marker = marker.trim();

        let body = match marker.rsplit_once(':') {
            Some((body, mult)) if !body.ends_with(':') => match mult.trim().parse::<f32>() {
                Ok(m) if m > 0.0 => {
                    modifiers.k_multiplier = m;
                    body
                }
                _ => marker,
            },
            _ => marker,
        };

        for token in body.split("::").map(str::trim).filter(|t| !t.is_empty()) {
            let lower = token.to_lowercase();
            if lower == "time" {
                modifiers.time = true;
            } else if lower == "rerank" {
                modifiers.rerank = true;
            } else if let Some(rest) = lower.strip_prefix("tagmemo") {
                modifiers.tag_memo = true;
                modifiers.tag_weight = rest.parse::<f32>().ok().map(|w| w.clamp(0.0, 1.0));
            } else {
                debug!(token, "Ignoring unknown retrieval modifier");
            }
        }
        modifiers
    }
}

/// Softmax corpus weights at `temperature` and the K each corpus receives.
///
/// Every corpus gets at least `min_k`; the rest of K is spread by weight.
pub fn allocate_k(sims: &[f32], total_k: usize, temperature: f32, min_k: usize) -> (Vec<f32>, Vec<usize>) {
    if sims.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let scaled: Vec<f32> = sims.iter().map(|s| s * temperature).collect();
    let max = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let weights: Vec<f32> = exps.iter().map(|e| e / sum).collect();

    let ks = weights
        .iter()
        .map(|w| ((w * total_k as f32).round() as usize).max(min_k))
        .collect();
    (weights, ks)
}

/// Drop near-duplicate hits, best first.
///
/// Hits are ordered by score (ties broken by similarity to `query`). A hit
/// is dropped when its trimmed text was already kept, or when its vector
/// has cosine similarity above `threshold` with a kept hit.
pub fn deduplicate_hits(mut hits: Vec<SearchHit>, query: &[f32], threshold: f32) -> Vec<SearchHit> {
    let affinity = |h: &SearchHit| {
        h.vector
            .as_deref()
            .map(|v| cosine_similarity(v, query))
            .unwrap_or(0.0)
    };
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| affinity(b).partial_cmp(&affinity(a)).unwrap_or(Ordering::Equal))
    });

    let mut seen_text: HashSet<String> = HashSet::new();
    let mut kept: Vec<SearchHit> = Vec::with_capacity(hits.len());
    for hit in hits {
        if !seen_text.insert(hit.text.trim().to_string()) {
            continue;
        }
        let duplicate = hit.vector.as_deref().is_some_and(|v| {
            kept.iter().any(|k| {
                k.vector
                    .as_deref()
                    .is_some_and(|kv| cosine_similarity(kv, v) > threshold)
            })
        });
        if !duplicate {
            kept.push(hit);
        }
    }
    kept
}

/// Union two hit lists by trimmed text, first list first.
pub fn union_by_text(first: Vec<SearchHit>, second: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen: HashSet<String> = HashSet::new();
    first
        .into_iter()
        .chain(second)
        .filter(|h| seen.insert(h.text.trim().to_string()))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    /// Corpora to search. Empty means every known corpus.
    pub corpora: Vec<String>,
    pub query_text: String,
    /// Precomputed query vector; embedded from `query_text` when absent.
    pub vector: Option<Vec<f32>>,
    /// Recent conversation text, used for K sizing and date parsing.
    pub context_text: Option<String>,
    /// Recent conversation turn vectors, oldest first.
    pub context_vectors: Vec<Vec<f32>>,
    /// Modifier marker, e.g. `::Time::TagMemo`.
    pub modifiers: String,
    /// Overrides the planned K.
    pub k: Option<usize>,
    /// Spotlight tags, strongest first.
    pub core_tags: Vec<String>,
    /// Hits whose text starts with any of these are dropped.
    pub exclude_prefixes: Vec<String>,
    /// Reference day for relative dates. Defaults to the local date.
    pub today: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub hits: Vec<SearchHit>,
    pub k: usize,
    pub plan: QueryPlan,
    pub modifiers: RetrievalModifiers,
    pub time_ranges: Vec<TimeRange>,
    pub cached: bool,
}

/// Per-query parameters shared by every path.
#[derive(Debug, Clone)]
struct Pass {
    query_text: String,
    vector: Vec<f32>,
    segments: Vec<Vec<f32>>,
    tag_weight: Option<f32>,
    core_tags: Vec<String>,
    time_ranges: Vec<TimeRange>,
    exclude_prefixes: Vec<String>,
    /// Candidates fetched per search beyond K.
    overfetch: f32,
}

/// Runs [`RetrievalRequest`]s against an [`Engine`].
#[derive(Clone)]
pub struct RetrievalOrchestrator {
    engine: Engine,
}

impl RetrievalOrchestrator {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn retrieve(&self, request: &RetrievalRequest) -> EngineResult<RetrievalOutcome> {
        let engine = &self.engine;
        let config = &engine.config().retrieval;

        let vector = match &request.vector {
            Some(v) => v.clone(),
            None => engine.embed_query(&request.query_text).await?,
        };
        let modifiers = RetrievalModifiers::parse(&request.modifiers);

        let signals = engine.get_signal_analysis(&vector)?;
        let window = ContextWindow::new(request.context_vectors.clone());
        let plan = engine.planner().plan(
            &signals,
            window.semantic_width(&vector),
            &request.query_text,
            request.context_text.as_deref(),
        );
        let base_k = request.k.unwrap_or(plan.k).max(1);
        let k = ((base_k as f32 * modifiers.k_multiplier).ceil() as usize).max(1);

        let day = request.today.unwrap_or_else(today);
        let time_ranges = if modifiers.time {
            let text = match &request.context_text {
                Some(context) => format!("{}\n{}", request.query_text, context),
                None => request.query_text.clone(),
            };
            parse_time_ranges(&text, day)
        } else {
            Vec::new()
        };

        let corpora = if request.corpora.is_empty() {
            engine.store().corpora().await?
        } else {
            request.corpora.clone()
        };
        let corpus_key = corpora.join(",");
        let cache_key = QueryKey {
            corpus: Some(&corpus_key),
            text: &request.query_text,
            modifiers: &request.modifiers,
            k,
            day: modifiers.time.then(|| day.format("%Y-%m-%d").to_string()),
            context: request.context_text.as_deref(),
            core_tags: &request.core_tags,
            exclude_prefixes: &request.exclude_prefixes,
            vector: vectors_digest(request.vector.iter().map(Vec::as_slice)),
            context_vectors: vectors_digest(request.context_vectors.iter().map(Vec::as_slice)),
        }
        .digest();

        if let Some(hits) = engine.cache().get_query(&cache_key) {
            debug!(k, "Query cache hit");
            return Ok(RetrievalOutcome {
                hits: hits.to_vec(),
                k,
                plan,
                modifiers,
                time_ranges,
                cached: true,
            });
        }

        let segments = window.segments(SEGMENT_THRESHOLD);
        let skip = segments.len().saturating_sub(config.max_history);
        let rerank = modifiers.rerank && engine.reranker().is_some();
        let pass = Pass {
            query_text: request.query_text.clone(),
            vector,
            segments: segments.into_iter().skip(skip).collect(),
            tag_weight: modifiers
                .tag_memo
                .then(|| modifiers.tag_weight.unwrap_or(plan.tag_weight)),
            core_tags: truncate_tags(&request.core_tags, plan.truncation_ratio),
            time_ranges: time_ranges.clone(),
            exclude_prefixes: request.exclude_prefixes.clone(),
            overfetch: if rerank {
                engine.config().rerank.multiplier.max(1.0)
            } else {
                1.0
            },
        };

        let mut hits = match corpora.len() {
            0 => Vec::new(),
            1 => self.single_corpus(&corpora[0], &pass, k).await?,
            _ => self.aggregate(&corpora, &pass, k).await?,
        };

        hits = match (rerank, engine.reranker()) {
            (true, Some(reranker)) => reranker.rerank(&pass.query_text, hits, k).await,
            _ => {
                hits.truncate(k);
                hits
            }
        };

        info!(
            corpora = corpora.len(),
            k,
            hits = hits.len(),
            time = !pass.time_ranges.is_empty(),
            rerank,
            "Retrieval complete"
        );
        engine.cache().put_query(cache_key, hits.clone());

        Ok(RetrievalOutcome {
            hits,
            k,
            plan,
            modifiers,
            time_ranges,
            cached: false,
        })
    }

    async fn single_corpus(&self, corpus: &str, pass: &Pass, k: usize) -> EngineResult<Vec<SearchHit>> {
        if pass.time_ranges.is_empty() {
            self.standard(corpus, pass, k).await
        } else {
            self.time_aware(corpus, pass, k).await
        }
    }

    /// Live vector plus decayed history segments, deduplicated.
    async fn standard(&self, corpus: &str, pass: &Pass, k: usize) -> EngineResult<Vec<SearchHit>> {
        let config = &self.engine.config().retrieval;
        let fetch = ((k as f32 * pass.overfetch).ceil() as usize).max(k) + config.k_buffer;

        let mut probes: Vec<(Vec<f32>, f32, usize)> = vec![(pass.vector.clone(), 1.0, fetch)];
        let n = pass.segments.len();
        for (i, segment) in pass.segments.iter().enumerate() {
            let distance = (n - i) as i32;
            let history_k = ((fetch as f32 / 2.0).round() as usize).max(2);
            probes.push((segment.clone(), config.history_decay.powi(distance), history_k));
        }

        let mut set = JoinSet::new();
        for (order, (vector, weight, probe_k)) in probes.into_iter().enumerate() {
            let engine = self.engine.clone();
            let request = SearchRequest {
                corpus: Some(corpus.to_string()),
                vector,
                k: probe_k,
                tag_weight: pass.tag_weight,
                core_tags: pass.core_tags.clone(),
                core_boost_factor: None,
            };
            set.spawn(async move { (order, weight, engine.search(&request).await) });
        }

        let mut batches: Vec<(usize, Vec<SearchHit>)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (order, weight, result) = match joined {
                Ok(out) => out,
                Err(e) => {
                    warn!(error = %e, "Search task failed");
                    continue;
                }
            };
            match result {
                Ok(mut hits) => {
                    for hit in &mut hits {
                        hit.score *= weight;
                    }
                    batches.push((order, hits));
                }
                // The live query must succeed; history probes may degrade
                Err(e) if order == 0 => return Err(e),
                Err(e) => warn!(error = %e, "History probe failed"),
            }
        }
        batches.sort_by_key(|(order, _)| *order);

        let flattened: Vec<SearchHit> = batches
            .into_iter()
            .flat_map(|(_, hits)| hits)
            .filter(|h| !excluded(h, &pass.exclude_prefixes))
            .collect();
        Ok(deduplicate_hits(flattened, &pass.vector, config.dedup_threshold))
    }

    /// Semantic share plus date share, unioned by text.
    async fn time_aware(&self, corpus: &str, pass: &Pass, k: usize) -> EngineResult<Vec<SearchHit>> {
        let share = self.engine.config().retrieval.time_semantic_share;
        let k_semantic = ((k as f32 * share).ceil() as usize).max(1);
        let k_time = k.saturating_sub(k_semantic);

        let mut semantic = self.standard(corpus, pass, k_semantic).await?;
        semantic.truncate(k_semantic);

        let dated = self.dated_hits(corpus, pass, k_time).await?;
        debug!(
            corpus,
            semantic = semantic.len(),
            dated = dated.len(),
            "Time-aware shares"
        );
        Ok(union_by_text(semantic, dated))
    }

    /// Chunks dated inside any requested range, ranked by similarity.
    async fn dated_hits(&self, corpus: &str, pass: &Pass, k: usize) -> EngineResult<Vec<SearchHit>> {
        let query = normalized(&pass.vector);
        let mut seen: HashSet<i64> = HashSet::new();
        let mut hits: Vec<SearchHit> = Vec::new();

        for range in &pass.time_ranges {
            let (start, end) = range.date_strings();
            let (start_ms, end_ms) = range.bounds_ms();
            let chunks = self
                .engine
                .store()
                .chunks_in_date_range(Some(corpus), &start, &end, start_ms, end_ms)
                .await?;
            for chunk in chunks {
                if !seen.insert(chunk.id) {
                    continue;
                }
                let score = chunk
                    .vector
                    .as_deref()
                    .map(|v| cosine_similarity(v, &query))
                    .unwrap_or(0.0);
                let mut hit = SearchHit::from_chunk(chunk, score);
                hit.origin = HitOrigin::Time;
                if !excluded(&hit, &pass.exclude_prefixes) {
                    hits.push(hit);
                }
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Split K across corpora by representative-vector similarity and run
    /// each corpus in parallel.
    async fn aggregate(&self, corpora: &[String], pass: &Pass, k: usize) -> EngineResult<Vec<SearchHit>> {
        let config = &self.engine.config().retrieval;

        let mut sims = Vec::with_capacity(corpora.len());
        for corpus in corpora {
            let sim = match self.engine.corpus_vector(corpus).await {
                Ok(Some(v)) => cosine_similarity(&v, &pass.vector),
                Ok(None) => 0.0,
                Err(e) => {
                    warn!(corpus = %corpus, error = %e, "No representative vector for corpus");
                    0.0
                }
            };
            sims.push(sim);
        }
        let (weights, ks) = allocate_k(&sims, k, config.aggregate_temperature, config.aggregate_min_k);
        debug!(?weights, ?ks, "Aggregate allocation");

        let mut set = JoinSet::new();
        for (order, (corpus, corpus_k)) in corpora.iter().zip(ks).enumerate() {
            let this = self.clone();
            let corpus = corpus.clone();
            let pass = pass.clone();
            set.spawn(async move {
                let mut hits = this.single_corpus(&corpus, &pass, corpus_k).await;
                if let Ok(hits) = &mut hits {
                    hits.truncate(corpus_k);
                }
                (order, corpus, hits)
            });
        }

        let mut per_corpus: Vec<(usize, Vec<SearchHit>)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((order, _, Ok(hits))) => per_corpus.push((order, hits)),
                Ok((_, corpus, Err(e))) => warn!(corpus = %corpus, error = %e, "Corpus search failed"),
                Err(e) => warn!(error = %e, "Corpus task failed"),
            }
        }
        per_corpus.sort_by_key(|(order, _)| *order);

        let mut merged: Vec<SearchHit> = per_corpus.into_iter().flat_map(|(_, hits)| hits).collect();
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        Ok(merged)
    }
}

fn excluded(hit: &SearchHit, prefixes: &[String]) -> bool {
    let text = hit.text.trim_start();
    prefixes
        .iter()
        .any(|p| !p.is_empty() && text.starts_with(p.as_str()))
}

impl Engine {
    /// Run a full retrieval request.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> EngineResult<RetrievalOutcome> {
        if request.query_text.trim().is_empty() && request.vector.is_none() {
            return Err(EngineError::Provider("empty query".to_string()));
        }
        RetrievalOrchestrator::new(self.clone()).retrieve(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: i64, text: &str, score: f32, vector: &[f32]) -> SearchHit {
        SearchHit {
            chunk_id: id,
            text: text.to_string(),
            score,
            vector: Some(vector.to_vec()),
            ..SearchHit::default()
        }
    }

    #[test]
    fn test_parse_modifiers() {
        let m = RetrievalModifiers::parse("::Time::Rerank::TagMemo0.3:1.5");
        assert!(m.time && m.rerank && m.tag_memo);
        assert_eq!(m.tag_weight, Some(0.3));
        assert!((m.k_multiplier - 1.5).abs() < 1e-6);

        let m = RetrievalModifiers::parse("::TagMemo");
        assert!(m.tag_memo);
        assert_eq!(m.tag_weight, None);
        assert_eq!(m.k_multiplier, 1.0);

        assert_eq!(RetrievalModifiers::parse(""), RetrievalModifiers::default());
        assert!(!RetrievalModifiers::parse("::Group").time);
    }

    #[test]
    fn test_allocate_k() {
        let (weights, ks) = allocate_k(&[0.9, 0.5, 0.1], 10, 3.0, 1);
        assert!(weights[0] > weights[1] && weights[1] > weights[2]);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(ks.iter().all(|k| *k >= 1));
        assert_eq!(ks, vec![7, 2, 1]);
    }

    #[test]
    fn test_allocate_k_floor() {
        let (_, ks) = allocate_k(&[1.0, 0.0, 0.0], 3, 10.0, 1);
        assert_eq!(ks, vec![3, 1, 1]);
        assert!(allocate_k(&[], 5, 3.0, 1).1.is_empty());
    }

    #[test]
    fn test_dedup_by_vector_and_text() {
        let hits = vec![
            hit(1, "alpha", 0.9, &[1.0, 0.0]),
            hit(2, "alpha again", 0.8, &[0.999, 0.01]),
            hit(3, " alpha ", 0.7, &[0.0, 1.0]),
            hit(4, "beta", 0.6, &[0.0, 1.0]),
        ];
        let kept = deduplicate_hits(hits, &[1.0, 0.0], 0.95);
        let ids: Vec<i64> = kept.iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_union_by_text() {
        let semantic = vec![hit(1, "a", 0.9, &[1.0]), hit(2, "b", 0.8, &[1.0])];
        let dated = vec![hit(3, "b ", 0.5, &[1.0]), hit(4, "c", 0.4, &[1.0])];
        let union = union_by_text(semantic, dated);
        let texts: Vec<&str> = union.iter().map(|h| h.text.trim()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert!(union.len() <= 4);
    }

    #[test]
    fn test_excluded_prefix() {
        let h = hit(1, "  [2024-05-01] went hiking", 0.5, &[1.0]);
        assert!(excluded(&h, &["[2024-05-01] went".to_string()]));
        assert!(!excluded(&h, &["".to_string()]));
    }
}
