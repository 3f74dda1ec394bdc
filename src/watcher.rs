//! Polling document-tree watcher.
//!
//! Walks the ingest root on a fixed interval, diffs the result against the
//! previous snapshot of `(mtime, size)` stamps, and emits [`FileEvent`]s
//! into an `mpsc` channel. The ingestion pipeline is the single consumer.
//!
//! Paths are reported relative to the root with `/` separators. The first
//! path component names the corpus; files directly under the root belong to
//! the `Root` corpus.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::IngestConfig;

pub const ROOT_CORPUS: &str = "Root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// File added or changed.
    Upsert(String),
    Remove(String),
}

/// Cheap change fingerprint: modification time (ms) and size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub mtime: i64,
    pub size: i64,
}

pub fn stat_file(path: &Path) -> std::io::Result<FileStamp> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()
        .unwrap_or(UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    Ok(FileStamp {
        mtime,
        size: metadata.len() as i64,
    })
}

/// Corpus name for a root-relative path.
pub fn corpus_of(relative: &str) -> String {
    match relative.split_once('/') {
        Some((first, _)) if !first.is_empty() => first.to_string(),
        _ => ROOT_CORPUS.to_string(),
    }
}

/// Include/exclude and ignore rules for candidate files.
pub struct FileFilter {
    include: GlobSet,
    exclude: GlobSet,
    ignore_folders: Vec<String>,
    ignore_prefixes: Vec<String>,
    ignore_suffixes: Vec<String>,
}

impl FileFilter {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            ignore_folders: config.ignore_folders.clone(),
            ignore_prefixes: config.ignore_prefixes.clone(),
            ignore_suffixes: config.ignore_suffixes.clone(),
        })
    }

    pub fn accepts(&self, relative: &str) -> bool {
        if relative.split('/').any(|part| part.starts_with('.')) {
            return false;
        }
        if let Some((folder, _)) = relative.split_once('/') {
            if self.ignore_folders.iter().any(|f| f == folder) {
                return false;
            }
        }

        let file_name = relative.rsplit('/').next().unwrap_or(relative);
        let stem = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(file_name);
        if self.ignore_prefixes.iter().any(|p| file_name.starts_with(p.as_str())) {
            return false;
        }
        if self.ignore_suffixes.iter().any(|s| stem.ends_with(s.as_str())) {
            return false;
        }

        !self.exclude.is_match(relative) && self.include.is_match(relative)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Walk `root` and stamp every accepted file.
pub fn scan_tree(root: &Path, filter: &FileFilter) -> Result<BTreeMap<String, FileStamp>> {
    if !root.exists() {
        bail!("Ingest root does not exist: {}", root.display());
    }

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if !filter.accepts(&rel_str) {
            continue;
        }

        match stat_file(path) {
            Ok(stamp) => {
                files.insert(rel_str, stamp);
            }
            // Deleted between walk and stat
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %rel_str, error = %e, "Failed to stat file"),
        }
    }
    Ok(files)
}

/// Snapshot-diffing watcher over one document tree.
pub struct TreeWatcher {
    root: PathBuf,
    filter: FileFilter,
    snapshot: BTreeMap<String, FileStamp>,
    interval: Duration,
}

impl TreeWatcher {
    /// Create a watcher. With `full_scan_on_startup` the first poll reports
    /// every existing file; otherwise only later changes are reported.
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let filter = FileFilter::new(config)?;
        let snapshot = if config.full_scan_on_startup {
            BTreeMap::new()
        } else {
            scan_tree(&config.root, &filter)?
        };
        Ok(Self {
            root: config.root.clone(),
            filter,
            snapshot,
            interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        })
    }

    /// Rescan and return the events since the previous poll, removals first.
    pub fn poll(&mut self) -> Result<Vec<FileEvent>> {
        let current = scan_tree(&self.root, &self.filter)?;

        let mut events: Vec<FileEvent> = self
            .snapshot
            .keys()
            .filter(|path| !current.contains_key(*path))
            .map(|path| FileEvent::Remove(path.clone()))
            .collect();

        for (path, stamp) in &current {
            if self.snapshot.get(path) != Some(stamp) {
                events.push(FileEvent::Upsert(path.clone()));
            }
        }

        self.snapshot = current;
        Ok(events)
    }

    /// Poll forever on the configured interval, forwarding events to `tx`.
    /// Stops when the receiver is dropped.
    pub fn spawn(mut self, tx: mpsc::Sender<FileEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let events = match self.poll() {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "Watcher scan failed");
                        continue;
                    }
                };
                if !events.is_empty() {
                    debug!(count = events.len(), "Watcher detected changes");
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config(root: &Path) -> IngestConfig {
        IngestConfig {
            root: root.to_path_buf(),
            ignore_folders: vec!["archive".to_string()],
            ignore_prefixes: vec!["draft_".to_string()],
            ignore_suffixes: vec!["_tmp".to_string()],
            ..IngestConfig::default()
        }
    }

    #[test]
    fn test_corpus_of() {
        assert_eq!(corpus_of("notes/a.md"), "notes");
        assert_eq!(corpus_of("notes/sub/a.md"), "notes");
        assert_eq!(corpus_of("a.md"), ROOT_CORPUS);
    }

    #[test]
    fn test_filter_rules() {
        let filter = FileFilter::new(&config(Path::new("."))).unwrap();
        assert!(filter.accepts("notes/a.md"));
        assert!(filter.accepts("top.txt"));
        assert!(!filter.accepts("notes/a.pdf"));
        assert!(!filter.accepts("archive/a.md"));
        assert!(!filter.accepts("notes/draft_a.md"));
        assert!(!filter.accepts("notes/a_tmp.md"));
        assert!(!filter.accepts("notes/.hidden.md"));
        assert!(!filter.accepts(".obsidian/x.md"));
    }

    #[test]
    fn test_poll_reports_changes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("notes")).unwrap();
        fs::write(tmp.path().join("notes/a.md"), "one").unwrap();
        fs::write(tmp.path().join("notes/b.md"), "two").unwrap();

        let mut watcher = TreeWatcher::new(&config(tmp.path())).unwrap();
        let first = watcher.poll().unwrap();
        assert_eq!(
            first,
            vec![
                FileEvent::Upsert("notes/a.md".to_string()),
                FileEvent::Upsert("notes/b.md".to_string()),
            ]
        );
        assert!(watcher.poll().unwrap().is_empty());

        fs::remove_file(tmp.path().join("notes/a.md")).unwrap();
        fs::write(tmp.path().join("notes/b.md"), "two, now longer").unwrap();
        let next = watcher.poll().unwrap();
        assert_eq!(
            next,
            vec![
                FileEvent::Remove("notes/a.md".to_string()),
                FileEvent::Upsert("notes/b.md".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_startup_scan_seeds_snapshot() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "one").unwrap();
        let mut cfg = config(tmp.path());
        cfg.full_scan_on_startup = false;

        let mut watcher = TreeWatcher::new(&cfg).unwrap();
        assert!(watcher.poll().unwrap().is_empty());
    }
}
