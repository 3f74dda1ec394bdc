//! Cross-encoder re-ranking with token-budget batching.
//!
//! Candidates are packed into batches whose estimated token count (query
//! included) stays under `max_tokens − 1000`. Each batch is one request to
//! `POST {url}/v1/rerank`. A failed batch keeps its original order, and two
//! circuit breakers bound the damage of a sick backend:
//!
//! - **per run**: once at least 4 batches were attempted and more than half
//!   failed, the remaining batches are passed through unranked;
//! - **across runs**: 5 failures within a minute skip re-ranking entirely
//!   until the window clears.
//!
//! The merged list is sorted by `rerank_score`, falling back to the
//! similarity score for unranked hits, and truncated to K.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chunk::is_cjk;
use crate::config::RerankConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::SearchHit;

const QUERY_BUDGET_SHARE: f32 = 0.3;
const SAFETY_MARGIN_TOKENS: usize = 1000;
const BREAKER_WINDOW: Duration = Duration::from_secs(60);
const BREAKER_THRESHOLD: usize = 5;
const MIN_BATCHES_FOR_ABORT: usize = 4;

/// A re-rank backend. Returns `(document index, relevance score)` pairs,
/// best first.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> EngineResult<Vec<(usize, f32)>>;
}

/// Rough token count: CJK characters count 1.5, everything else 0.25.
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(c, o), ch| {
        if is_cjk(ch) {
            (c + 1, o)
        } else {
            (c, o + 1)
        }
    });
    (cjk as f32 * 1.5 + other as f32 * 0.25).ceil() as usize
}

/// Cut `query` down to roughly `max_tokens`, keeping a 10% margin.
fn truncate_query(query: &str, max_tokens: usize) -> String {
    let tokens = estimate_tokens(query);
    if tokens <= max_tokens {
        return query.to_string();
    }
    let chars = query.chars().count();
    let keep = (chars as f32 * (max_tokens as f32 / tokens as f32) * 0.9).floor() as usize;
    warn!(tokens, max_tokens, "Re-rank query too long, truncating");
    let mut truncated: String = query.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

/// HTTP re-ranker speaking the `/v1/rerank` protocol.
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> anyhow::Result<Self> {
        let base = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("rerank.url must be set when re-ranking is enabled"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.model must be set when re-ranking is enabled"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/v1/rerank", base.trim_end_matches('/')),
            model,
            api_key: std::env::var("RERANK_API_KEY").ok(),
        })
    }
}

#[async_trait]
impl RerankProvider for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> EngineResult<Vec<(usize, f32)>> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": documents.len(),
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Rerank(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Rerank(format!("HTTP {}: {}", status, text)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Rerank(e.to_string()))?;
        parse_rerank_response(&json, documents.len())
    }
}

fn parse_rerank_response(json: &Value, doc_count: usize) -> EngineResult<Vec<(usize, f32)>> {
    let results = json
        .get("results")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::Rerank("response is missing results array".to_string()))?;

    let mut ranked = Vec::with_capacity(results.len());
    for item in results {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| EngineError::Rerank("result missing index".to_string()))?
            as usize;
        let score = item
            .get("relevance_score")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| EngineError::Rerank("result missing relevance_score".to_string()))?
            as f32;
        if index < doc_count {
            ranked.push((index, score));
        }
    }
    Ok(ranked)
}

/// Batching and circuit-breaking wrapper around a [`RerankProvider`].
pub struct Reranker {
    provider: Arc<dyn RerankProvider>,
    max_tokens: usize,
    failures: Mutex<VecDeque<Instant>>,
}

impl Reranker {
    pub fn new(provider: Arc<dyn RerankProvider>, max_tokens: usize) -> Self {
        Self {
            provider,
            max_tokens,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    fn recent_failures(&self) -> usize {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > BREAKER_WINDOW)
        {
            failures.pop_front();
        }
        failures.len()
    }

    fn record_failure(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Instant::now());
    }

    /// Re-rank `hits` against `query` and keep the best `k`. Never fails:
    /// on any provider trouble hits fall back to their similarity order.
    pub async fn rerank(&self, query: &str, hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
        if hits.is_empty() {
            return hits;
        }
        if self.recent_failures() >= BREAKER_THRESHOLD {
            warn!("Re-rank circuit breaker open, skipping");
            return finish(hits, k);
        }

        let query = truncate_query(
            query,
            (self.max_tokens as f32 * QUERY_BUDGET_SHARE).floor() as usize,
        );
        let query_tokens = estimate_tokens(&query);
        let budget = self
            .max_tokens
            .saturating_sub(query_tokens)
            .saturating_sub(SAFETY_MARGIN_TOKENS);

        let (batches, oversized) = pack_batches(&hits, query_tokens, budget);
        if batches.is_empty() {
            warn!("No document fits the re-rank budget");
            return finish(hits, k);
        }

        let mut slots: Vec<Option<SearchHit>> = hits.into_iter().map(Some).collect();
        let mut merged: Vec<SearchHit> = Vec::with_capacity(slots.len());
        let mut failed = 0usize;
        let total = batches.len();

        for (attempted, batch) in batches.iter().enumerate() {
            let documents: Vec<String> = batch
                .iter()
                .filter_map(|i| slots[*i].as_ref().map(|h| h.text.clone()))
                .collect();

            match self.provider.rerank(&query, &documents).await {
                Ok(ranked) => {
                    for (pos, score) in ranked {
                        if let Some(mut hit) = slots[batch[pos]].take() {
                            hit.rerank_score = Some(score);
                            merged.push(hit);
                        }
                    }
                    // Anything the backend left out keeps its place
                    merged.extend(batch.iter().filter_map(|i| slots[*i].take()));
                }
                Err(e) => {
                    failed += 1;
                    self.record_failure();
                    warn!(batch = attempted + 1, error = %e, "Re-rank batch failed, keeping original order");
                    merged.extend(batch.iter().filter_map(|i| slots[*i].take()));

                    let attempted = attempted + 1;
                    if attempted >= MIN_BATCHES_FOR_ABORT && failed * 2 > attempted {
                        warn!(failed, attempted, "Too many re-rank failures, aborting run");
                        break;
                    }
                }
            }
        }

        // Batches skipped by the breaker plus oversized documents
        merged.extend(slots.into_iter().flatten());

        info!(
            batches = total,
            failed,
            oversized = oversized,
            "Re-rank complete"
        );
        finish(merged, k)
    }
}

/// Greedy packing of hit indices into token-bounded batches. Documents that
/// alone exceed the budget are left out and counted.
fn pack_batches(hits: &[SearchHit], query_tokens: usize, budget: usize) -> (Vec<Vec<usize>>, usize) {
    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = query_tokens;
    let mut oversized = 0;

    for (i, hit) in hits.iter().enumerate() {
        let tokens = estimate_tokens(&hit.text);
        if tokens > budget {
            debug!(tokens, budget, "Document too large to re-rank");
            oversized += 1;
            continue;
        }
        if current_tokens + tokens > budget && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = query_tokens;
        }
        current.push(i);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    (batches, oversized)
}

fn finish(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        let sa = a.rerank_score.unwrap_or(a.score);
        let sb = b.rerank_score.unwrap_or(b.score);
        sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
    });
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct FailingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RerankProvider for FailingProvider {
        async fn rerank(&self, _query: &str, _documents: &[String]) -> EngineResult<Vec<(usize, f32)>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Err(EngineError::Rerank("HTTP 500 Internal Server Error".to_string()))
        }
    }

    /// Ranks documents by length, longest first.
    struct LengthProvider;

    #[async_trait]
    impl RerankProvider for LengthProvider {
        async fn rerank(&self, _query: &str, documents: &[String]) -> EngineResult<Vec<(usize, f32)>> {
            let mut ranked: Vec<(usize, f32)> = documents
                .iter()
                .enumerate()
                .map(|(i, d)| (i, d.len() as f32 / 100.0))
                .collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
            Ok(ranked)
        }
    }

    fn hits(n: usize) -> Vec<SearchHit> {
        (0..n)
            .map(|i| SearchHit {
                chunk_id: i as i64,
                text: format!("doc {} {}", i, "x".repeat(i)),
                score: 1.0 - i as f32 * 0.05,
                ..SearchHit::default()
            })
            .collect()
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("记忆"), 3);
    }

    #[test]
    fn test_truncate_query() {
        let long = "a".repeat(400);
        let truncated = truncate_query(&long, 50);
        assert!(estimate_tokens(&truncated) <= 50);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_query("short", 50), "short");
    }

    #[test]
    fn test_parse_response() {
        let json = serde_json::json!({
            "results": [
                { "index": 1, "relevance_score": 0.9 },
                { "index": 0, "relevance_score": 0.2 },
                { "index": 7, "relevance_score": 0.1 }
            ]
        });
        assert_eq!(parse_rerank_response(&json, 2).unwrap(), vec![(1, 0.9), (0, 0.2)]);
        assert!(parse_rerank_response(&serde_json::json!({}), 2).is_err());
    }

    #[test]
    fn test_pack_batches_respects_budget() {
        let hits = hits(6);
        let (batches, oversized) = pack_batches(&hits, 2, 6);
        assert_eq!(oversized, 0);
        assert!(batches.len() > 1);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 6);
    }

    #[tokio::test]
    async fn test_failing_backend_keeps_similarity_order() {
        let provider = Arc::new(FailingProvider {
            calls: AtomicUsize::new(0),
        });
        // Tiny budget: one document per batch
        let reranker = Reranker::new(provider.clone(), 1004);
        let out = reranker.rerank("q", hits(8), 5).await;

        assert_eq!(out.len(), 5);
        let ids: Vec<i64> = out.iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(out.iter().all(|h| h.rerank_score.is_none()));
        // Run aborted after the fourth failed batch
        assert_eq!(provider.calls.load(AtomicOrdering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cross_run_breaker_skips_provider() {
        let provider = Arc::new(FailingProvider {
            calls: AtomicUsize::new(0),
        });
        let reranker = Reranker::new(provider.clone(), 1004);
        reranker.rerank("q", hits(8), 3).await;
        reranker.rerank("q", hits(8), 3).await;
        let calls = provider.calls.load(AtomicOrdering::SeqCst);
        assert_eq!(calls, 8);

        let out = reranker.rerank("q", hits(8), 3).await;
        assert_eq!(out.len(), 3);
        assert_eq!(provider.calls.load(AtomicOrdering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_successful_rerank_reorders() {
        let reranker = Reranker::new(Arc::new(LengthProvider), 30_000);
        let out = reranker.rerank("q", hits(4), 2).await;
        let ids: Vec<i64> = out.iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert!(out[0].rerank_score.is_some());
    }
}
