//! Core data models used throughout Memory Harness.
//!
//! These types represent the files, chunks, tags and search hits that flow
//! through the ingestion and retrieval pipeline.

use serde::Serialize;

/// A document on disk, as tracked by the relational store.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    /// Path relative to the watched root, `/`-separated.
    pub path: String,
    pub corpus: String,
    /// Hex sha256 of the file content.
    pub checksum: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
    pub size: i64,
    /// `YYYY-MM-DD` parsed from the document header, if any.
    pub entry_date: Option<String>,
    pub updated_at: i64,
}

/// A chunk row. Its `id` is also the key in the corpus vector index.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: i64,
    pub file_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub vector: Option<Vec<f32>>,
}

/// A chunk joined with its owning file, as returned by hydration.
#[derive(Debug, Clone, Serialize)]
pub struct StoredChunk {
    pub id: i64,
    pub content: String,
    pub path: String,
    pub corpus: String,
    pub entry_date: Option<String>,
    pub mtime: i64,
    #[serde(skip)]
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct TagRecord {
    pub id: i64,
    pub name: String,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default)]
pub struct KvEntry {
    pub key: String,
    pub value: Option<String>,
    pub vector: Option<Vec<f32>>,
}

/// Which retrieval path produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HitOrigin {
    #[default]
    Semantic,
    Time,
}

/// A single retrieval result handed back to the caller.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchHit {
    pub chunk_id: i64,
    pub text: String,
    pub score: f32,
    /// File name without directories.
    pub source_file: String,
    pub full_path: String,
    pub corpus: String,
    pub matched_tags: Vec<String>,
    pub core_tags_matched: Vec<String>,
    pub tag_match_score: f32,
    pub tag_match_count: usize,
    pub boost_factor: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    pub origin: HitOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip)]
    pub vector: Option<Vec<f32>>,
}

impl SearchHit {
    /// Build a hit from a hydrated chunk and a similarity score.
    pub fn from_chunk(chunk: StoredChunk, score: f32) -> Self {
        let source_file = chunk
            .path
            .rsplit('/')
            .next()
            .unwrap_or(chunk.path.as_str())
            .to_string();
        Self {
            chunk_id: chunk.id,
            text: chunk.content,
            score,
            source_file,
            full_path: chunk.path,
            corpus: chunk.corpus,
            date: chunk.entry_date,
            vector: chunk.vector,
            boost_factor: 0.0,
            ..Default::default()
        }
    }
}
