#![allow(dead_code)]

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use memory_harness::config::Config;
use memory_harness::embedding::EmbeddingProvider;
use memory_harness::index::FlatIndexFactory;
use memory_harness::{Engine, EngineResult};

pub const DIMS: usize = 256;

/// Deterministic bag-of-words embedder: every lowercase word lands in one
/// FNV-hashed bucket with a hashed sign.
pub struct HashEmbedder;

fn fnv1a(word: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let h = fnv1a(&word.to_lowercase());
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        v[(h % DIMS as u64) as usize] += sign;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    } else {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

/// Counts texts sent to the wrapped embedder.
#[derive(Default)]
pub struct CountingEmbedder {
    pub texts: AtomicUsize,
}

impl CountingEmbedder {
    pub fn count(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow-counting"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        HashEmbedder.embed(texts).await
    }
}

/// Config rooted in a temp dir with short timers and small chunks.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.store.path = root.join("data/memory.sqlite");
    config.index.dir = root.join("data/indices");
    config.index.save_delay_ms = 50;
    config.index.tag_save_delay_ms = 50;
    config.ingest.root = root.join("notes");
    config.ingest.max_tokens = 16;
    config.ingest.batch_window_ms = 50;
    config.ingest.poll_interval_ms = 50;
    fs::create_dir_all(&config.ingest.root).unwrap();
    config
}

pub fn write_note(config: &Config, relative: &str, content: &str) {
    let path = config.ingest.root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

pub async fn open_engine(config: Config, embedder: Arc<dyn EmbeddingProvider>) -> Engine {
    let engine = Engine::open(config, Arc::new(FlatIndexFactory), embedder)
        .await
        .unwrap();
    engine.settle().await;
    engine
}

pub fn setup() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    (tmp, config)
}

/// Ingest everything under the notes root and wait for signals to settle.
pub async fn sync(engine: &Engine) {
    engine.ingestion_pipeline().unwrap().sync_all().await.unwrap();
    engine.refresh_signals().await.unwrap();
}
