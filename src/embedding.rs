//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `/v1/embeddings` endpoint.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Callers go through [`embed_batch`], which normalizes text, splits the
//! input into provider-sized batches and degrades failures into per-item
//! `None` ("no vector") instead of errors.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry after a fixed delay
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - `max_retries` attempts in total (default 3)

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, EngineResult};

/// An embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed already-normalized, non-empty texts, one vector per input.
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;
}

/// Build the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

static EMOJI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\x{1F000}-\x{1FAFF}\x{2600}-\x{27BF}\x{2B00}-\x{2BFF}\x{FE00}-\x{FE0F}\x{200D}\x{20E3}]",
    )
    .expect("static regex")
});
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static NEWLINE_PAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" *\n *").expect("static regex"));
static MULTI_NEWLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("static regex"));

/// Normalize text before it reaches the embedder.
///
/// Strips emoji and decorative symbols, collapses runs of spaces and tabs,
/// trims spaces around newlines, collapses blank lines, and trims the ends.
pub fn prepare_text(text: &str) -> String {
    let text = EMOJI_RE.replace_all(text, "");
    let text = SPACES_RE.replace_all(&text, " ");
    let text = NEWLINE_PAD_RE.replace_all(&text, "\n");
    let text = MULTI_NEWLINE_RE.replace_all(&text, "\n");
    text.trim().to_string()
}

/// Embed `texts`, returning one slot per input.
///
/// A slot is `None` when the normalized text is empty, when the provider
/// failed for the batch that contained it, or when the returned vector has
/// the wrong dimension.
pub async fn embed_batch(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Vec<Option<Vec<f32>>> {
    let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

    let prepared: Vec<(usize, String)> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| (i, prepare_text(t)))
        .filter(|(_, t)| !t.is_empty())
        .collect();

    let dims = provider.dims();
    for batch in prepared.chunks(batch_size.max(1)) {
        let inputs: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
        match provider.embed(&inputs).await {
            Ok(vectors) => {
                if vectors.len() != inputs.len() {
                    warn!(
                        expected = inputs.len(),
                        got = vectors.len(),
                        "Embedding response size mismatch, dropping batch"
                    );
                    continue;
                }
                for ((slot, _), vector) in batch.iter().zip(vectors) {
                    if vector.len() != dims {
                        warn!(
                            "{}",
                            EngineError::DimensionMismatch {
                                expected: dims,
                                actual: vector.len()
                            }
                        );
                        continue;
                    }
                    out[*slot] = Some(vector);
                }
            }
            Err(e) => {
                warn!(error = %e, batch = inputs.len(), "Embedding batch failed");
            }
        }
    }

    out
}

/// Embed a single text. `None` when empty or on failure.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Option<Vec<f32>> {
    embed_batch(provider, &[text.to_string()], 1)
        .await
        .into_iter()
        .next()
        .flatten()
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Err(EngineError::Provider("embedding provider is disabled".to_string()))
    }
}

// ============ HTTP retry loop ============

/// POST `body` to `url`, retrying transient failures with a fixed delay.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    retry_delay: Duration,
) -> EngineResult<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..max_retries.max(1) {
        if attempt > 0 {
            tokio::time::sleep(retry_delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| EngineError::Provider(format!("invalid response body: {}", e)));
                }

                let body_text = response.text().await.unwrap_or_default();

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    debug!(attempt, %status, "Transient embedding error");
                    last_err = Some(format!("{}: {}", status, body_text));
                    continue;
                }

                return Err(EngineError::Provider(format!("{}: {}", status, body_text)));
            }
            Err(e) => {
                last_err = Some(e.to_string());
                continue;
            }
        }
    }

    Err(EngineError::TransientProvider(
        last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
    ))
}

fn http_client(config: &EmbeddingConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

// ============ OpenAI Provider ============

/// Embedding provider for OpenAI and OpenAI-compatible servers.
///
/// Uses `embedding.url` as the base URL when set (default
/// `https://api.openai.com`). The `OPENAI_API_KEY` environment variable is
/// sent as a bearer token when present and is required only for the
/// default endpoint.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if config.url.is_none() && api_key.is_none() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }

        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            dims,
            url: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            api_key,
            client: http_client(config)?,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            self.retry_delay,
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Parse the `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> EngineResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EngineError::Provider("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EngineError::Provider("missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (`POST /api/embed`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            client: http_client(config)?,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            &self.url,
            None,
            &body,
            self.max_retries,
            self.retry_delay,
        )
        .await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EngineError::Provider("missing embeddings array".to_string()))?;

        embeddings
            .iter()
            .map(|e| {
                e.as_array()
                    .map(|a| to_f32_vec(a))
                    .ok_or_else(|| EngineError::Provider("embedding is not an array".to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        dims: usize,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::TransientProvider("503".to_string()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32; self.dims]).collect())
        }
    }

    #[test]
    fn test_prepare_text_strips_and_collapses() {
        let raw = "  Hello \t 🌟world  \n\n\n  next  line ✨ ";
        assert_eq!(prepare_text(raw), "Hello world\nnext line");
    }

    #[test]
    fn test_prepare_text_empty_after_normalization() {
        assert_eq!(prepare_text(" 🎉 \n\t "), "");
    }

    #[tokio::test]
    async fn test_empty_text_yields_sentinel_without_call() {
        let provider = FixedProvider {
            dims: 2,
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let out = embed_batch(&provider, &["🎉".to_string()], 8).await;
        assert_eq!(out, vec![None]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batches_preserve_slots() {
        let provider = FixedProvider {
            dims: 2,
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let texts = vec!["ab".to_string(), "".to_string(), "abcd".to_string()];
        let out = embed_batch(&provider, &texts, 1).await;
        assert_eq!(out[0], Some(vec![2.0, 2.0]));
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some(vec![4.0, 4.0]));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_none() {
        let provider = FixedProvider {
            dims: 2,
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let out = embed_batch(&provider, &["text".to_string()], 8).await;
        assert_eq!(out, vec![None]);
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let parsed = parse_openai_response(&json).unwrap();
        assert_eq!(parsed, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }
}
