//! Vector index capability.
//!
//! The engine never depends on a concrete ANN algorithm. It talks to
//! [`VectorIndex`] for add/remove/search/save and obtains instances through
//! an injected [`IndexFactory`]. [`flat::FlatIndex`] is the bundled
//! implementation: exact cosine search, good enough for tens of thousands of
//! chunks and fully deterministic.
//!
//! Keys are `i64` row ids from the relational store (chunk ids for corpus
//! indices, tag ids for the global tag index).

pub mod flat;

use std::path::Path;
use thiserror::Error;

pub use flat::{FlatIndex, FlatIndexFactory};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("id {0} already present")]
    Duplicate(i64),

    #[error("dimension mismatch: index has {expected}, vector has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index is full ({0} entries)")]
    CapacityExceeded(usize),

    #[error("corrupt index file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One search result: the stored id and its cosine similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub id: i64,
    pub score: f32,
}

/// A mutable nearest-neighbour index over fixed-dimension vectors.
pub trait VectorIndex: Send + Sync {
    fn dimensions(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: i64) -> bool;

    /// Insert a vector. Fails with [`IndexError::Duplicate`] if `id` exists.
    fn add(&mut self, id: i64, vector: &[f32]) -> Result<(), IndexError>;

    /// Remove `id`. Returns whether it was present.
    fn remove(&mut self, id: i64) -> bool;

    /// Up to `k` hits ordered by descending similarity.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError>;

    /// Persist to `path`, replacing any previous file atomically.
    fn save(&self, path: &Path) -> Result<(), IndexError>;
}

/// Creates and loads [`VectorIndex`] instances.
pub trait IndexFactory: Send + Sync {
    fn create(&self, dims: usize, capacity: usize) -> Box<dyn VectorIndex>;

    fn load(
        &self,
        path: &Path,
        dims: usize,
        capacity: usize,
    ) -> Result<Box<dyn VectorIndex>, IndexError>;
}

/// Add `vector` under `id`, replacing any existing entry.
///
/// A duplicate-key failure is resolved by removing the id and retrying
/// once. Every other error is returned to the caller unchanged.
pub fn upsert(index: &mut dyn VectorIndex, id: i64, vector: &[f32]) -> Result<(), IndexError> {
    match index.add(id, vector) {
        Err(IndexError::Duplicate(_)) => {
            index.remove(id);
            index.add(id, vector)
        }
        other => other,
    }
}
