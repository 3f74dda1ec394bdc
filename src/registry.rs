//! Index registry: one vector index per corpus plus one global tag index.
//!
//! Corpus indices are created lazily on first reference and stay resident
//! for the lifetime of the registry. Each is backed by a file in the index
//! directory named from a hash of the corpus name.
//!
//! # Load, build, recover
//!
//! ```text
//! get_or_create(corpus)
//!   ├─ memoized? ──────────────▶ shared handle
//!   └─ load_or_build
//!        ├─ file loads ────────▶ index
//!        └─ absent / corrupt ──▶ empty index
//!                                 └─ spawn recovery: replay store vectors
//! ```
//!
//! # Persistence
//!
//! Saving is never done on the write path. Mutations call
//! [`IndexRegistry::schedule_save`], which keeps a single pending timer per
//! index and restarts it on every call, so a burst of writes costs one
//! flush. The tag index uses a longer delay. [`IndexRegistry::flush_all`]
//! cancels every timer and saves immediately (shutdown).
//!
//! Index locks are `std::sync::RwLock` and are never held across `.await`.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::error::EngineError;
use crate::index::{self, IndexError, IndexFactory, IndexHit, VectorIndex};
use crate::store::RelationalStore;

pub type SharedIndex = Arc<RwLock<Box<dyn VectorIndex>>>;

pub fn read_index(index: &SharedIndex) -> RwLockReadGuard<'_, Box<dyn VectorIndex>> {
    index.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_index(index: &SharedIndex) -> RwLockWriteGuard<'_, Box<dyn VectorIndex>> {
    index.write().unwrap_or_else(PoisonError::into_inner)
}

/// Which vectors an index holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexScope {
    Corpus(String),
    Tags,
}

impl IndexScope {
    /// Deterministic on-disk file name.
    pub fn file_name(&self) -> String {
        match self {
            IndexScope::Corpus(name) => {
                let digest = hex::encode(Sha256::digest(name.as_bytes()));
                format!("index_corpus_{}.vidx", &digest[..32])
            }
            IndexScope::Tags => "index_global_tags.vidx".to_string(),
        }
    }

    fn store_filter(&self) -> Option<&str> {
        match self {
            IndexScope::Corpus(name) => Some(name.as_str()),
            IndexScope::Tags => None,
        }
    }
}

struct PendingSave {
    index: SharedIndex,
    handle: JoinHandle<()>,
}

struct Inner {
    store: RelationalStore,
    factory: Arc<dyn IndexFactory>,
    dir: PathBuf,
    dims: usize,
    capacity: usize,
    save_delay: Duration,
    tag_save_delay: Duration,
    corpora: tokio::sync::Mutex<HashMap<String, SharedIndex>>,
    tags: SharedIndex,
    timers: Mutex<HashMap<IndexScope, PendingSave>>,
    recoveries: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct IndexRegistry {
    inner: Arc<Inner>,
}

impl IndexRegistry {
    /// Open the registry and load (or rebuild) the global tag index.
    pub fn open(
        store: RelationalStore,
        factory: Arc<dyn IndexFactory>,
        config: &IndexConfig,
        dims: usize,
    ) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.dir)?;

        let tags_path = config.dir.join(IndexScope::Tags.file_name());
        let (tags, loaded) = load_or_create(
            factory.as_ref(),
            &tags_path,
            &IndexScope::Tags,
            dims,
            config.capacity,
        );

        let registry = Self {
            inner: Arc::new(Inner {
                store,
                factory,
                dir: config.dir.clone(),
                dims,
                capacity: config.capacity,
                save_delay: Duration::from_millis(config.save_delay_ms),
                tag_save_delay: Duration::from_millis(config.tag_save_delay_ms),
                corpora: tokio::sync::Mutex::new(HashMap::new()),
                tags,
                timers: Mutex::new(HashMap::new()),
                recoveries: Mutex::new(Vec::new()),
            }),
        };
        if !loaded {
            registry.spawn_recovery(IndexScope::Tags, registry.tag_index());
        }
        Ok(registry)
    }

    pub fn dims(&self) -> usize {
        self.inner.dims
    }

    pub fn index_path(&self, scope: &IndexScope) -> PathBuf {
        self.inner.dir.join(scope.file_name())
    }

    pub fn tag_index(&self) -> SharedIndex {
        self.inner.tags.clone()
    }

    /// Memoized, lazily created index for `corpus`.
    pub async fn get_or_create(&self, corpus: &str) -> SharedIndex {
        let mut corpora = self.inner.corpora.lock().await;
        if let Some(index) = corpora.get(corpus) {
            return index.clone();
        }
        let index = self.load_or_build(&IndexScope::Corpus(corpus.to_string()));
        corpora.insert(corpus.to_string(), index.clone());
        index
    }

    /// Already-loaded corpus index, without creating one.
    pub async fn get(&self, corpus: &str) -> Option<SharedIndex> {
        self.inner.corpora.lock().await.get(corpus).cloned()
    }

    /// Names and sizes of every resident corpus index.
    pub async fn loaded(&self) -> Vec<(String, usize)> {
        let corpora = self.inner.corpora.lock().await;
        let mut out: Vec<(String, usize)> = corpora
            .iter()
            .map(|(name, index)| (name.clone(), read_index(index).len()))
            .collect();
        out.sort();
        out
    }

    /// Load the persisted index for `scope`, or start an empty one and
    /// recover it from the store in the background.
    fn load_or_build(&self, scope: &IndexScope) -> SharedIndex {
        let (index, loaded) = load_or_create(
            self.inner.factory.as_ref(),
            &self.index_path(scope),
            scope,
            self.inner.dims,
            self.inner.capacity,
        );
        if !loaded {
            self.spawn_recovery(scope.clone(), index.clone());
        }
        index
    }

    fn spawn_recovery(&self, scope: IndexScope, index: SharedIndex) {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            match registry.recover(&scope, &index).await {
                Ok(0) => debug!(scope = ?scope, "Nothing to recover"),
                Ok(count) => {
                    info!(scope = ?scope, count, "Recovered index from store");
                    registry.schedule_save(&scope, index);
                }
                Err(e) => warn!(scope = ?scope, error = %e, "Index recovery failed"),
            }
        });
        self.inner
            .recoveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Replay every stored vector of `scope` into `index`. Returns the
    /// number of entries kept.
    pub async fn recover(&self, scope: &IndexScope, index: &SharedIndex) -> Result<usize, EngineError> {
        let vectors = self.inner.store.vectors_for_scope(scope.store_filter()).await?;
        self.replay(scope, index, &vectors).await
    }

    /// Upsert a store snapshot, then drop the ids the store no longer holds.
    ///
    /// A delete that lands after the snapshot removes its ids from the index
    /// either before the upsert (and is caught by the re-check) or after it.
    pub async fn replay(
        &self,
        scope: &IndexScope,
        index: &SharedIndex,
        snapshot: &[(i64, Vec<f32>)],
    ) -> Result<usize, EngineError> {
        let written = self.upsert_entries(index, snapshot);
        let ids: Vec<i64> = snapshot.iter().map(|(id, _)| *id).collect();
        let live = self.inner.store.live_ids(scope.store_filter(), &ids).await?;
        let stale: Vec<i64> = ids.into_iter().filter(|id| !live.contains(id)).collect();
        if stale.is_empty() {
            return Ok(written);
        }
        let removed = self.remove_entries(index, &stale);
        debug!(scope = ?scope, removed, "Dropped entries deleted during recovery");
        Ok(written.saturating_sub(removed))
    }

    /// Upsert a set of entries. Failures other than duplicates are logged
    /// and the entry skipped.
    pub fn upsert_entries(&self, index: &SharedIndex, entries: &[(i64, Vec<f32>)]) -> usize {
        let mut guard = write_index(index);
        let mut written = 0;
        for (id, vector) in entries {
            match index::upsert(guard.as_mut(), *id, vector) {
                Ok(()) => written += 1,
                Err(e) => warn!(id, error = %e, "Skipping index entry"),
            }
        }
        written
    }

    pub fn remove_entries(&self, index: &SharedIndex, ids: &[i64]) -> usize {
        let mut guard = write_index(index);
        ids.iter().filter(|id| guard.remove(**id)).count()
    }

    /// Search one corpus. A corpus that was never seen yields no hits.
    pub async fn search(&self, corpus: &str, query: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        let index = self.get_or_create(corpus).await;
        let guard = read_index(&index);
        guard.search(query, k)
    }

    pub fn search_tags(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        read_index(&self.inner.tags).search(query, k)
    }

    /// Arm (or re-arm) the single save timer for `scope`.
    pub fn schedule_save(&self, scope: &IndexScope, index: SharedIndex) {
        let delay = match scope {
            IndexScope::Tags => self.inner.tag_save_delay,
            IndexScope::Corpus(_) => self.inner.save_delay,
        };
        let path = self.index_path(scope);
        let registry = self.clone();
        let task_scope = scope.clone();
        let task_index = index.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.take_timer(&task_scope);
            save_index(&task_index, &path);
        });

        let mut timers = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.insert(scope.clone(), PendingSave { index, handle }) {
            previous.handle.abort();
        }
    }

    fn take_timer(&self, scope: &IndexScope) {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope);
    }

    /// Number of armed save timers.
    pub fn pending_saves(&self) -> usize {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel every pending timer and save those indices now.
    pub fn flush_all(&self) {
        let pending: Vec<(IndexScope, PendingSave)> = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (scope, save) in pending {
            save.handle.abort();
            save_index(&save.index, &self.index_path(&scope));
        }
    }

    /// Wait for background recoveries started so far.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .recoveries
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Stop background work without saving.
    pub fn cancel_background(&self) {
        for (_, save) in self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            save.handle.abort();
        }
        for handle in self
            .inner
            .recoveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

/// Returns the index and whether it was loaded from disk.
fn load_or_create(
    factory: &dyn IndexFactory,
    path: &Path,
    scope: &IndexScope,
    dims: usize,
    capacity: usize,
) -> (SharedIndex, bool) {
    if path.exists() {
        match factory.load(path, dims, capacity) {
            Ok(index) => {
                info!(scope = ?scope, entries = index.len(), "Loaded vector index");
                return (Arc::new(RwLock::new(index)), true);
            }
            Err(e) => {
                let err = EngineError::IndexCorruption {
                    name: scope.file_name(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Rebuilding index from store");
            }
        }
    }
    (Arc::new(RwLock::new(factory.create(dims, capacity))), false)
}

fn save_index(index: &SharedIndex, path: &Path) {
    let guard = read_index(index);
    match guard.save(path) {
        Ok(()) => debug!(path = %path.display(), entries = guard.len(), "Saved vector index"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to save vector index"),
    }
}
