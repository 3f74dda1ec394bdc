//! Ingestion pipeline orchestration.
//!
//! Keeps the relational store and the vector indices in lock-step with the
//! watched document tree:
//!
//! ```text
//! watcher ──mpsc──▶ pending set ──(max batch | debounce)──▶ flush
//!                                                            │
//!   stat diff ─▶ hash diff ─▶ chunk + tags ─▶ embed chunks ─▶ embed new tags
//!                                                            │
//!   one transaction ─▶ index remove/upsert ─▶ schedule saves ─▶ refresh signals
//! ```
//!
//! Only one flush runs at a time. A flush requested while another is in
//! progress marks the pipeline dirty, and the running flush performs exactly
//! one follow-up pass before returning to collecting.
//!
//! Chunks that normalize to nothing are dropped before embedding, so a file
//! made only of them is stored with zero chunks. Files whose remaining chunks
//! did not all receive a vector are not written; they go back to the pending
//! set for the next cycle.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk::chunk_text;
use crate::embedding::{embed_batch, prepare_text};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::extract::{extract_entry_date, TagExtractor};
use crate::registry::IndexScope;
use crate::store::FileWrite;
use crate::watcher::{corpus_of, scan_tree, stat_file, FileEvent, FileFilter, FileStamp, TreeWatcher};

const EVENT_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Collecting,
    Flushing,
}

struct PipelineState {
    pending: BTreeSet<String>,
    phase: Phase,
    /// A flush was requested while one was running.
    rerun: bool,
}

/// Counters for one or more flushed batches.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    /// Files chunked, embedded and written.
    pub written: usize,
    pub chunks: usize,
    /// Stat matched the stored record.
    pub unchanged: usize,
    /// Stat differed but content hash matched; only mtime/size updated.
    pub touched: usize,
    pub deleted: usize,
    /// Left pending because some vector was missing.
    pub deferred: usize,
    pub failed: usize,
    pub new_tags: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.written += other.written;
        self.chunks += other.chunks;
        self.unchanged += other.unchanged;
        self.touched += other.touched;
        self.deleted += other.deleted;
        self.deferred += other.deferred;
        self.failed += other.failed;
        self.new_tags += other.new_tags;
    }
}

/// A changed file, read and split, waiting for vectors.
struct Prepared {
    path: String,
    corpus: String,
    checksum: String,
    stamp: FileStamp,
    entry_date: Option<String>,
    chunks: Vec<String>,
    tags: Vec<String>,
}

pub struct IngestionPipeline {
    engine: Engine,
    filter: FileFilter,
    extractor: TagExtractor,
    state: Mutex<PipelineState>,
}

impl IngestionPipeline {
    pub fn new(engine: Engine) -> Result<Self> {
        let config = engine.config();
        let filter = FileFilter::new(&config.ingest)?;
        let extractor = TagExtractor::new(&config.tags)?;
        Ok(Self {
            engine,
            filter,
            extractor,
            state: Mutex::new(PipelineState {
                pending: BTreeSet::new(),
                phase: Phase::Collecting,
                rerun: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a watcher event. Returns the pending count.
    pub fn enqueue(&self, event: FileEvent) -> usize {
        let path = match event {
            FileEvent::Upsert(path) if self.filter.accepts(&path) => path,
            FileEvent::Upsert(_) => return self.pending_len(),
            // Removal is detected at flush time from the missing file
            FileEvent::Remove(path) => path,
        };
        let mut state = self.lock();
        state.pending.insert(path);
        state.pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Process everything pending, in batches of `max_batch_size`.
    pub async fn flush(&self) -> Result<FlushReport> {
        {
            let mut state = self.lock();
            if state.phase == Phase::Flushing {
                state.rerun = true;
                return Ok(FlushReport::default());
            }
            state.phase = Phase::Flushing;
        }

        let result = self.flush_passes().await;
        self.lock().phase = Phase::Collecting;
        result
    }

    async fn flush_passes(&self) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let mut follow_up = false;
        loop {
            let paths: Vec<String> = std::mem::take(&mut self.lock().pending).into_iter().collect();
            let mut deferred = Vec::new();

            let max = self.engine.config().ingest.max_batch_size.max(1);
            let mut outcome = Ok(());
            let mut batches = paths.chunks(max);
            for batch in batches.by_ref() {
                match self.process_batch(batch).await {
                    Ok((batch_report, batch_deferred)) => {
                        report.absorb(batch_report);
                        deferred.extend(batch_deferred);
                    }
                    Err(e) => {
                        // The whole batch stays pending for the next cycle
                        deferred.extend(batch.iter().cloned());
                        outcome = Err(e);
                        break;
                    }
                }
            }
            for batch in batches {
                deferred.extend(batch.iter().cloned());
            }

            let rerun = {
                let mut state = self.lock();
                state.pending.extend(deferred);
                std::mem::take(&mut state.rerun)
            };
            outcome?;

            if rerun && !follow_up {
                follow_up = true;
                debug!("Running follow-up flush");
                continue;
            }
            break;
        }

        info!(
            written = report.written,
            chunks = report.chunks,
            unchanged = report.unchanged,
            touched = report.touched,
            deleted = report.deleted,
            deferred = report.deferred,
            failed = report.failed,
            "Ingestion flush complete"
        );
        Ok(report)
    }

    /// Diff, embed and write one batch. Returns the report and the paths
    /// to retry later.
    async fn process_batch(&self, paths: &[String]) -> Result<(FlushReport, Vec<String>)> {
        let engine = &self.engine;
        let config = engine.config();
        let store = engine.store();
        let mut report = FlushReport::default();
        let mut prepared: Vec<Prepared> = Vec::new();

        for rel in paths {
            let abs = config.ingest.root.join(rel);
            let stamp = match stat_file(&abs) {
                Ok(stamp) => stamp,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if self.handle_delete(rel).await? {
                        report.deleted += 1;
                    }
                    continue;
                }
                Err(source) => {
                    let err = EngineError::FileRead {
                        path: rel.clone(),
                        source,
                    };
                    warn!(error = %err, "Skipping file");
                    report.failed += 1;
                    continue;
                }
            };

            let existing = store.file_by_path(rel).await?;
            if let Some(record) = &existing {
                if record.mtime == stamp.mtime && record.size == stamp.size {
                    report.unchanged += 1;
                    continue;
                }
            }

            let content = match tokio::fs::read_to_string(&abs).await {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if self.handle_delete(rel).await? {
                        report.deleted += 1;
                    }
                    continue;
                }
                Err(source) => {
                    let err = EngineError::FileRead {
                        path: rel.clone(),
                        source,
                    };
                    warn!(error = %err, "Skipping file");
                    report.failed += 1;
                    continue;
                }
            };
            let checksum = hex::encode(Sha256::digest(content.as_bytes()));

            if let Some(record) = &existing {
                if record.checksum == checksum {
                    store.update_stat(record.id, stamp.mtime, stamp.size).await?;
                    report.touched += 1;
                    continue;
                }
            }

            prepared.push(Prepared {
                path: rel.clone(),
                corpus: corpus_of(rel),
                checksum,
                stamp,
                entry_date: extract_entry_date(&content),
                chunks: chunk_text(&content, config.ingest.max_tokens)
                    .into_iter()
                    .filter(|chunk| !prepare_text(chunk).is_empty())
                    .collect(),
                tags: self.extractor.extract(&content),
            });
        }

        if prepared.is_empty() {
            return Ok((report, Vec::new()));
        }

        // Chunk vectors, one provider pass for the whole batch
        let embedder = engine.embedder().as_ref();
        let batch_size = config.embedding.batch_size;
        let texts: Vec<String> = prepared.iter().flat_map(|p| p.chunks.iter().cloned()).collect();
        let mut vectors = embed_batch(embedder, &texts, batch_size).await.into_iter();

        // Vectors for tags seen for the first time (or still missing one)
        let names: Vec<String> = prepared
            .iter()
            .flat_map(|p| p.tags.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let known = store.tags_with_vectors(&names).await?;
        let missing: Vec<String> = names.into_iter().filter(|n| !known.contains(n)).collect();
        let tag_vectors: HashMap<String, Vec<f32>> = missing
            .iter()
            .cloned()
            .zip(embed_batch(embedder, &missing, batch_size).await)
            .filter_map(|(name, vector)| vector.map(|v| (name, v)))
            .collect();
        if tag_vectors.len() < missing.len() {
            debug!(
                missing = missing.len() - tag_vectors.len(),
                "Some tags stored without vectors"
            );
        }

        let mut writes = Vec::with_capacity(prepared.len());
        let mut deferred = Vec::new();
        for file in prepared {
            let slots: Vec<Option<Vec<f32>>> = vectors.by_ref().take(file.chunks.len()).collect();
            if slots.iter().any(Option::is_none) {
                debug!(path = %file.path, "Deferring file with unembedded chunks");
                deferred.push(file.path);
                continue;
            }
            writes.push(FileWrite {
                path: file.path,
                corpus: file.corpus,
                checksum: file.checksum,
                mtime: file.stamp.mtime,
                size: file.stamp.size,
                entry_date: file.entry_date,
                chunks: file.chunks.into_iter().zip(slots.into_iter().flatten()).collect(),
                tags: file.tags,
            });
        }
        report.deferred = deferred.len();

        if writes.is_empty() {
            return Ok((report, deferred));
        }

        let committed = store.write_batch(&writes, &tag_vectors).await?;

        let registry = engine.registry();
        for file in &committed.files {
            let index = registry.get_or_create(&file.corpus).await;
            registry.remove_entries(&index, &file.old_chunk_ids);
            registry.upsert_entries(&index, &file.new_chunks);
            registry.schedule_save(&IndexScope::Corpus(file.corpus.clone()), index);
            report.chunks += file.new_chunks.len();
        }
        report.written = committed.files.len();

        if !committed.new_tags.is_empty() {
            let tags = registry.tag_index();
            registry.upsert_entries(&tags, &committed.new_tags);
            registry.schedule_save(&IndexScope::Tags, tags);
            report.new_tags = committed.new_tags.len();
        }

        engine.after_commit();
        Ok((report, deferred))
    }

    /// Remove a vanished file from the store and its corpus index. Returns
    /// whether anything was indexed under `path`.
    pub async fn handle_delete(&self, path: &str) -> Result<bool> {
        let Some((corpus, chunk_ids)) = self.engine.store().delete_file(path).await? else {
            return Ok(false);
        };

        let registry = self.engine.registry();
        let index = registry.get_or_create(&corpus).await;
        let removed = registry.remove_entries(&index, &chunk_ids);
        registry.schedule_save(&IndexScope::Corpus(corpus.clone()), index);
        info!(path, corpus = %corpus, removed, "Removed deleted file");

        self.engine.after_commit();
        Ok(true)
    }

    /// Queue every file under the root plus every stored file that vanished,
    /// then flush.
    pub async fn sync_all(&self) -> Result<FlushReport> {
        let root = &self.engine.config().ingest.root;
        let on_disk = scan_tree(root, &self.filter)?;
        let stored = self.engine.store().file_paths().await?;
        {
            let mut state = self.lock();
            state.pending.extend(on_disk.keys().cloned());
            state
                .pending
                .extend(stored.into_iter().filter(|p| !on_disk.contains_key(p)));
        }
        self.flush().await
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Ingestion flush failed, files stay pending");
        }
    }

    /// Single consumer of watcher events. Flushes when the pending set
    /// reaches `max_batch_size` or after `batch_window_ms` of quiet, and
    /// drains once more when the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<FileEvent>) {
        let config = &self.engine.config().ingest;
        let window = Duration::from_millis(config.batch_window_ms);
        let max_batch = config.max_batch_size.max(1);
        let mut deadline: Option<Instant> = None;

        loop {
            let armed = deadline;
            let debounce = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if self.enqueue(event) >= max_batch {
                            self.flush_logged().await;
                            deadline = (self.pending_len() > 0).then(|| Instant::now() + window);
                        } else {
                            deadline = Some(Instant::now() + window);
                        }
                    }
                    None => {
                        self.flush_logged().await;
                        break;
                    }
                },
                _ = debounce => {
                    self.flush_logged().await;
                    deadline = (self.pending_len() > 0).then(|| Instant::now() + window);
                }
            }
        }
    }

    /// Start the tree watcher and the event loop. Both handles are tracked
    /// by the engine and stopped on shutdown.
    pub fn watch(self: Arc<Self>) -> Result<()> {
        let watcher = TreeWatcher::new(&self.engine.config().ingest)?;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let engine = self.engine.clone();

        let watch_handle: JoinHandle<()> = watcher.spawn(tx);
        let run_handle: JoinHandle<()> = tokio::spawn(self.run(rx));
        engine.track(watch_handle);
        engine.track(run_handle);
        info!(root = %engine.config().ingest.root.display(), "Watching document tree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_absorb() {
        let mut total = FlushReport::default();
        total.absorb(FlushReport {
            written: 2,
            chunks: 5,
            ..FlushReport::default()
        });
        total.absorb(FlushReport {
            written: 1,
            deferred: 1,
            ..FlushReport::default()
        });
        assert_eq!(total.written, 3);
        assert_eq!(total.chunks, 5);
        assert_eq!(total.deferred, 1);
    }
}
