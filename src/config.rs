//! Configuration parsing and validation.
//!
//! Memory Harness is configured via a TOML file (default: `config/memh.toml`).
//! Every section is optional and falls back to defaults tuned for a personal
//! knowledge base of a few thousand documents.
//!
//! # Example
//!
//! ```toml
//! [store]
//! path = "./data/memory.sqlite"
//!
//! [index]
//! dir = "./data/indices"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [ingest]
//! root = "./notes"
//! include_globs = ["**/*.md", "**/*.txt"]
//!
//! [rerank]
//! enabled = true
//! url = "http://localhost:8080"
//! model = "bge-reranker-v2-m3"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/memory.sqlite"),
        }
    }
}

/// Vector index placement and persistence timing.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Debounce delay before a mutated corpus index is written to disk.
    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,
    /// Debounce delay for the shared tag index.
    #[serde(default = "default_tag_save_delay_ms")]
    pub tag_save_delay_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            capacity: default_capacity(),
            save_delay_ms: default_save_delay_ms(),
            tag_save_delay_ms: default_tag_save_delay_ms(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/indices")
}
fn default_capacity() -> usize {
    50_000
}
fn default_save_delay_ms() -> u64 {
    120_000
}
fn default_tag_save_delay_ms() -> u64 {
    300_000
}

/// Embedding provider selection.
///
/// `provider` is one of `"disabled"`, `"openai"` or `"ollama"`. The
/// OpenAI provider also works against any OpenAI-compatible endpoint when
/// `url` is set.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

/// Document tree watching and batching.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Top-level folder names that are never indexed.
    #[serde(default)]
    pub ignore_folders: Vec<String>,
    #[serde(default)]
    pub ignore_prefixes: Vec<String>,
    #[serde(default)]
    pub ignore_suffixes: Vec<String>,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub full_scan_on_startup: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            ignore_folders: Vec::new(),
            ignore_prefixes: Vec::new(),
            ignore_suffixes: Vec::new(),
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            full_scan_on_startup: true,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./notes")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_batch_window_ms() -> u64 {
    2000
}
fn default_max_batch_size() -> usize {
    50
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_max_tokens() -> usize {
    700
}

/// Tag extraction and tag-boost tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct TagsConfig {
    /// Exact tag names dropped at extraction time.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Regex patterns stripped out of every tag name before filtering.
    #[serde(default)]
    pub blacklist_super: Vec<String>,
    #[serde(default = "default_expand_max")]
    pub expand_max: usize,
    #[serde(default = "default_pyramid_max_levels")]
    pub pyramid_max_levels: usize,
    #[serde(default = "default_pyramid_energy")]
    pub pyramid_energy: f32,
    #[serde(default = "default_tag_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_core_boost_range")]
    pub core_boost_range: [f32; 2],
    #[serde(default = "default_activation_range")]
    pub activation_range: [f32; 2],
    #[serde(default = "default_lang_penalty_unknown")]
    pub lang_penalty_unknown: f32,
    #[serde(default = "default_lang_penalty_cross_domain")]
    pub lang_penalty_cross_domain: f32,
    /// Dominant-world labels treated as technical (no language penalty).
    #[serde(default = "default_technical_worlds")]
    pub technical_worlds: Vec<String>,
    /// Dominant-world labels that get the softened, square-rooted penalty.
    #[serde(default = "default_social_worlds")]
    pub social_worlds: Vec<String>,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            blacklist_super: Vec::new(),
            expand_max: default_expand_max(),
            pyramid_max_levels: default_pyramid_max_levels(),
            pyramid_energy: default_pyramid_energy(),
            dedup_threshold: default_tag_dedup_threshold(),
            core_boost_range: default_core_boost_range(),
            activation_range: default_activation_range(),
            lang_penalty_unknown: default_lang_penalty_unknown(),
            lang_penalty_cross_domain: default_lang_penalty_cross_domain(),
            technical_worlds: default_technical_worlds(),
            social_worlds: default_social_worlds(),
        }
    }
}

fn default_expand_max() -> usize {
    30
}
fn default_pyramid_max_levels() -> usize {
    4
}
fn default_pyramid_energy() -> f32 {
    0.9
}
fn default_tag_dedup_threshold() -> f32 {
    0.88
}
fn default_core_boost_range() -> [f32; 2] {
    [1.2, 1.4]
}
fn default_activation_range() -> [f32; 2] {
    [0.5, 1.5]
}
fn default_lang_penalty_unknown() -> f32 {
    0.05
}
fn default_lang_penalty_cross_domain() -> f32 {
    0.1
}
fn default_technical_worlds() -> Vec<String> {
    ["Technology", "Programming", "Engineering", "Science"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_social_worlds() -> Vec<String> {
    ["Politics", "Society", "History", "Economics", "Culture"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Dynamic parameter ranges for the query planner.
#[derive(Debug, Deserialize, Clone)]
pub struct PlannerConfig {
    #[serde(default = "default_tag_weight_range")]
    pub tag_weight_range: [f32; 2],
    #[serde(default = "default_noise_penalty")]
    pub noise_penalty: f32,
    #[serde(default = "default_truncation_base")]
    pub truncation_base: f32,
    #[serde(default = "default_truncation_range")]
    pub truncation_range: [f32; 2],
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            tag_weight_range: default_tag_weight_range(),
            noise_penalty: default_noise_penalty(),
            truncation_base: default_truncation_base(),
            truncation_range: default_truncation_range(),
        }
    }
}

fn default_tag_weight_range() -> [f32; 2] {
    [0.05, 0.45]
}
fn default_noise_penalty() -> f32 {
    0.05
}
fn default_truncation_base() -> f32 {
    0.6
}
fn default_truncation_range() -> [f32; 2] {
    [0.5, 0.9]
}

/// Orchestrator tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_history_decay")]
    pub history_decay: f32,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Cosine similarity above which two results count as the same passage.
    #[serde(default = "default_result_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_time_semantic_share")]
    pub time_semantic_share: f32,
    #[serde(default = "default_aggregate_temperature")]
    pub aggregate_temperature: f32,
    #[serde(default = "default_aggregate_min_k")]
    pub aggregate_min_k: usize,
    /// Extra candidates fetched beyond K to survive dedup.
    #[serde(default = "default_k_buffer")]
    pub k_buffer: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            history_decay: default_history_decay(),
            max_history: default_max_history(),
            dedup_threshold: default_result_dedup_threshold(),
            time_semantic_share: default_time_semantic_share(),
            aggregate_temperature: default_aggregate_temperature(),
            aggregate_min_k: default_aggregate_min_k(),
            k_buffer: default_k_buffer(),
        }
    }
}

fn default_history_decay() -> f32 {
    0.85
}
fn default_max_history() -> usize {
    3
}
fn default_result_dedup_threshold() -> f32 {
    0.95
}
fn default_time_semantic_share() -> f32 {
    0.6
}
fn default_aggregate_temperature() -> f32 {
    3.0
}
fn default_aggregate_min_k() -> usize {
    1
}
fn default_k_buffer() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_rerank_max_tokens")]
    pub max_tokens: usize,
    /// Candidate over-fetch factor when re-ranking is requested.
    #[serde(default = "default_rerank_multiplier")]
    pub multiplier: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            model: None,
            max_tokens: default_rerank_max_tokens(),
            multiplier: default_rerank_multiplier(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_max_tokens() -> usize {
    30_000
}
fn default_rerank_multiplier() -> f32 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_query_max")]
    pub query_max: u64,
    #[serde(default = "default_query_ttl_secs")]
    pub query_ttl_secs: u64,
    #[serde(default = "default_embedding_max")]
    pub embedding_max: u64,
    #[serde(default = "default_embedding_ttl_secs")]
    pub embedding_ttl_secs: u64,
    #[serde(default = "default_derived_max")]
    pub derived_max: u64,
    #[serde(default = "default_derived_ttl_secs")]
    pub derived_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_max: default_query_max(),
            query_ttl_secs: default_query_ttl_secs(),
            embedding_max: default_embedding_max(),
            embedding_ttl_secs: default_embedding_ttl_secs(),
            derived_max: default_derived_max(),
            derived_ttl_secs: default_derived_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_query_max() -> u64 {
    200
}
fn default_query_ttl_secs() -> u64 {
    3600
}
fn default_embedding_max() -> u64 {
    500
}
fn default_embedding_ttl_secs() -> u64 {
    7200
}
fn default_derived_max() -> u64 {
    50
}
fn default_derived_ttl_secs() -> u64 {
    1800
}
fn default_sweep_interval_secs() -> u64 {
    300
}

/// Load and validate configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or
/// fails validation (unknown provider, missing dims for an enabled
/// provider, inverted ranges).
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Validate a configuration built in code or parsed from TOML.
pub fn validate(config: &Config) -> Result<()> {
    if config.ingest.max_tokens == 0 {
        anyhow::bail!("ingest.max_tokens must be > 0");
    }
    if config.ingest.max_batch_size == 0 {
        anyhow::bail!("ingest.max_batch_size must be > 0");
    }
    if config.index.capacity == 0 {
        anyhow::bail!("index.capacity must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    for (name, range) in [
        ("tags.core_boost_range", config.tags.core_boost_range),
        ("tags.activation_range", config.tags.activation_range),
        ("planner.tag_weight_range", config.planner.tag_weight_range),
        ("planner.truncation_range", config.planner.truncation_range),
    ] {
        if range[0] > range[1] {
            anyhow::bail!("{} must be [min, max] with min <= max", name);
        }
    }

    if !(0.0..=1.0).contains(&config.retrieval.time_semantic_share) {
        anyhow::bail!("retrieval.time_semantic_share must be in [0.0, 1.0]");
    }
    if config.retrieval.aggregate_temperature <= 0.0 {
        anyhow::bail!("retrieval.aggregate_temperature must be > 0");
    }

    if config.rerank.enabled && (config.rerank.url.is_none() || config.rerank.model.is_none()) {
        anyhow::bail!("rerank.url and rerank.model are required when rerank is enabled");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.ingest.batch_window_ms, 2000);
        assert_eq!(config.ingest.max_batch_size, 50);
        assert_eq!(config.index.save_delay_ms, 120_000);
        assert_eq!(config.tags.dedup_threshold, 0.88);
        assert_eq!(config.cache.query_max, 200);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_enabled_provider_requires_dims() {
        let config: Config = toml::from_str(
            r#"
            [embedding]
            provider = "openai"
            model = "text-embedding-3-small"
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"nope\"\n").unwrap();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("Unknown embedding provider"));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let config: Config =
            toml::from_str("[planner]\ntag_weight_range = [0.5, 0.1]\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rerank_requires_endpoint() {
        let config: Config = toml::from_str("[rerank]\nenabled = true\n").unwrap();
        assert!(validate(&config).is_err());
    }
}
