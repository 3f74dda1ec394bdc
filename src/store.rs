//! Relational metadata store.
//!
//! Wraps the single-connection SQLite pool and owns every SQL statement the
//! engine issues. Callers never see rows, only the types in
//! [`crate::models`].
//!
//! Writes coming from ingestion go through [`RelationalStore::write_batch`],
//! which applies a whole batch in one transaction: tags first, then each
//! file's chunk set is replaced wholesale and its tag links rebuilt.

use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use crate::models::{FileRecord, KvEntry, StoredChunk, TagRecord};
use crate::vector::{blob_to_vec, vec_to_blob};

/// SQLite caps bound parameters per statement; id lists are split into
/// batches of this size.
const IN_BATCH: usize = 500;

/// One file's worth of data to write during an ingestion batch.
#[derive(Debug, Clone)]
pub struct FileWrite {
    pub path: String,
    pub corpus: String,
    pub checksum: String,
    pub mtime: i64,
    pub size: i64,
    pub entry_date: Option<String>,
    /// Chunk texts in order, each with its embedding.
    pub chunks: Vec<(String, Vec<f32>)>,
    pub tags: Vec<String>,
}

/// What a committed file write changed, for index maintenance.
#[derive(Debug, Clone)]
pub struct CommittedFile {
    pub path: String,
    pub corpus: String,
    pub old_chunk_ids: Vec<i64>,
    pub new_chunks: Vec<(i64, Vec<f32>)>,
}

#[derive(Debug, Clone, Default)]
pub struct CommittedBatch {
    pub files: Vec<CommittedFile>,
    /// Tags that received a vector in this batch.
    pub new_tags: Vec<(i64, Vec<f32>)>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub files: i64,
    pub chunks: i64,
    pub tags: i64,
    pub corpora: Vec<String>,
}

#[derive(Clone)]
pub struct RelationalStore {
    pool: SqlitePool,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn row_to_stored_chunk(row: &sqlx::sqlite::SqliteRow) -> StoredChunk {
    let blob: Option<Vec<u8>> = row.get("vector");
    StoredChunk {
        id: row.get("id"),
        content: row.get("content"),
        path: row.get("path"),
        corpus: row.get("corpus"),
        entry_date: row.get("entry_date"),
        mtime: row.get("mtime"),
        vector: blob.map(|b| blob_to_vec(&b)),
    }
}

fn row_to_tag(row: &sqlx::sqlite::SqliteRow) -> TagRecord {
    let blob: Option<Vec<u8>> = row.get("vector");
    TagRecord {
        id: row.get("id"),
        name: row.get("name"),
        vector: blob.map(|b| blob_to_vec(&b)),
    }
}

impl RelationalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn file_by_path(&self, path: &str) -> Result<Option<FileRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, path, corpus, checksum, mtime, size, entry_date, updated_at \
             FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| FileRecord {
            id: row.get("id"),
            path: row.get("path"),
            corpus: row.get("corpus"),
            checksum: row.get("checksum"),
            mtime: row.get("mtime"),
            size: row.get("size"),
            entry_date: row.get("entry_date"),
            updated_at: row.get("updated_at"),
        }))
    }

    /// Refresh the stat fingerprint of a file whose content did not change.
    pub async fn update_stat(&self, file_id: i64, mtime: i64, size: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE files SET mtime = ?, size = ? WHERE id = ?")
            .bind(mtime)
            .bind(size)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Names among `names` that already have a stored vector.
    pub async fn tags_with_vectors(&self, names: &[String]) -> Result<HashSet<String>, sqlx::Error> {
        let mut found = HashSet::new();
        for batch in names.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT name FROM tags WHERE vector IS NOT NULL AND name IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for name in batch {
                query = query.bind(name);
            }
            for row in query.fetch_all(&self.pool).await? {
                found.insert(row.get::<String, _>("name"));
            }
        }
        Ok(found)
    }

    /// Apply one ingestion batch atomically.
    ///
    /// `tag_vectors` holds embeddings for tags first seen in this batch. An
    /// existing tag keeps its vector; a tag stored without one is backfilled.
    pub async fn write_batch(
        &self,
        files: &[FileWrite],
        tag_vectors: &HashMap<String, Vec<f32>>,
    ) -> Result<CommittedBatch, sqlx::Error> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut committed = CommittedBatch::default();

        // Upsert tags
        let mut tag_ids: HashMap<String, i64> = HashMap::new();
        for name in files.iter().flat_map(|f| f.tags.iter()) {
            if tag_ids.contains_key(name) {
                continue;
            }
            let vector = tag_vectors.get(name);
            sqlx::query(
                "INSERT INTO tags (name, vector) VALUES (?, ?) \
                 ON CONFLICT(name) DO UPDATE SET vector = COALESCE(tags.vector, excluded.vector)",
            )
            .bind(name)
            .bind(vector.map(|v| vec_to_blob(v)))
            .execute(&mut *tx)
            .await?;

            let id: i64 = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;
            if let Some(v) = vector {
                committed.new_tags.push((id, v.clone()));
            }
            tag_ids.insert(name.clone(), id);
        }

        for file in files {
            let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
                .bind(&file.path)
                .fetch_optional(&mut *tx)
                .await?;

            let (file_id, old_chunk_ids) = match existing {
                Some(file_id) => {
                    let old: Vec<i64> =
                        sqlx::query_scalar("SELECT id FROM chunks WHERE file_id = ?")
                            .bind(file_id)
                            .fetch_all(&mut *tx)
                            .await?;

                    sqlx::query(
                        "UPDATE files SET corpus = ?, checksum = ?, mtime = ?, size = ?, \
                         entry_date = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(&file.corpus)
                    .bind(&file.checksum)
                    .bind(file.mtime)
                    .bind(file.size)
                    .bind(&file.entry_date)
                    .bind(now)
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query("DELETE FROM chunks WHERE file_id = ?")
                        .bind(file_id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM file_tags WHERE file_id = ?")
                        .bind(file_id)
                        .execute(&mut *tx)
                        .await?;

                    (file_id, old)
                }
                None => {
                    let result = sqlx::query(
                        "INSERT INTO files (path, corpus, checksum, mtime, size, entry_date, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&file.path)
                    .bind(&file.corpus)
                    .bind(&file.checksum)
                    .bind(file.mtime)
                    .bind(file.size)
                    .bind(&file.entry_date)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    (result.last_insert_rowid(), Vec::new())
                }
            };

            let mut new_chunks = Vec::with_capacity(file.chunks.len());
            for (i, (content, vector)) in file.chunks.iter().enumerate() {
                let result = sqlx::query(
                    "INSERT INTO chunks (file_id, chunk_index, content, vector) VALUES (?, ?, ?, ?)",
                )
                .bind(file_id)
                .bind(i as i64)
                .bind(content)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
                new_chunks.push((result.last_insert_rowid(), vector.clone()));
            }

            for name in &file.tags {
                if let Some(tag_id) = tag_ids.get(name) {
                    sqlx::query("INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?, ?)")
                        .bind(file_id)
                        .bind(tag_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }

            committed.files.push(CommittedFile {
                path: file.path.clone(),
                corpus: file.corpus.clone(),
                old_chunk_ids,
                new_chunks,
            });
        }

        tx.commit().await?;
        Ok(committed)
    }

    /// Delete a file and (by cascade) its chunks and tag links.
    ///
    /// Returns the file's corpus and the removed chunk ids, or `None` if the
    /// path was never indexed.
    pub async fn delete_file(&self, path: &str) -> Result<Option<(String, Vec<i64>)>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id, corpus FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let file_id: i64 = row.get("id");
        let corpus: String = row.get("corpus");

        let chunk_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some((corpus, chunk_ids)))
    }

    /// Load chunks by id. Ids missing from the store are absent from the map.
    pub async fn hydrate_chunks(&self, ids: &[i64]) -> Result<HashMap<i64, StoredChunk>, sqlx::Error> {
        let mut out = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT c.id, c.content, c.vector, f.path, f.corpus, f.entry_date, f.mtime \
                 FROM chunks c JOIN files f ON f.id = c.file_id WHERE c.id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let chunk = row_to_stored_chunk(&row);
                out.insert(chunk.id, chunk);
            }
        }
        Ok(out)
    }

    /// All chunks belonging to the given file paths, in path then chunk order.
    pub async fn chunks_by_file_paths(&self, paths: &[String]) -> Result<Vec<StoredChunk>, sqlx::Error> {
        let mut out = Vec::new();
        for batch in paths.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT c.id, c.content, c.vector, f.path, f.corpus, f.entry_date, f.mtime \
                 FROM chunks c JOIN files f ON f.id = c.file_id WHERE f.path IN ({}) \
                 ORDER BY f.path, c.chunk_index",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for path in batch {
                query = query.bind(path);
            }
            for row in query.fetch_all(&self.pool).await? {
                out.push(row_to_stored_chunk(&row));
            }
        }
        Ok(out)
    }

    /// Chunks of files dated within `[start, end]` (inclusive, `YYYY-MM-DD`).
    ///
    /// A file without a parsed entry date is matched on its mtime instead,
    /// given as `[start_ms, end_ms)`.
    pub async fn chunks_in_date_range(
        &self,
        corpus: Option<&str>,
        start: &str,
        end: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<StoredChunk>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT c.id, c.content, c.vector, f.path, f.corpus, f.entry_date, f.mtime \
             FROM chunks c JOIN files f ON f.id = c.file_id \
             WHERE (? IS NULL OR f.corpus = ?) \
               AND ((f.entry_date IS NOT NULL AND f.entry_date BETWEEN ? AND ?) \
                 OR (f.entry_date IS NULL AND f.mtime >= ? AND f.mtime < ?)) \
             ORDER BY c.id",
        )
        .bind(corpus)
        .bind(corpus)
        .bind(start)
        .bind(end)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_stored_chunk).collect())
    }

    pub async fn corpora(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT DISTINCT corpus FROM files ORDER BY corpus")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn file_paths(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT path FROM files ORDER BY path")
            .fetch_all(&self.pool)
            .await
    }

    /// Every stored vector in a scope: a corpus's chunks, or (`None`) the
    /// global tag table.
    pub async fn vectors_for_scope(&self, scope: Option<&str>) -> Result<Vec<(i64, Vec<f32>)>, sqlx::Error> {
        let rows = match scope {
            Some(corpus) => {
                sqlx::query(
                    "SELECT c.id, c.vector FROM chunks c JOIN files f ON f.id = c.file_id \
                     WHERE f.corpus = ? AND c.vector IS NOT NULL",
                )
                .bind(corpus)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, vector FROM tags WHERE vector IS NOT NULL")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                (row.get::<i64, _>("id"), blob_to_vec(&blob))
            })
            .collect())
    }

    /// The subset of `ids` that still has a stored vector in `scope`.
    pub async fn live_ids(&self, scope: Option<&str>, ids: &[i64]) -> Result<HashSet<i64>, sqlx::Error> {
        let mut live = HashSet::with_capacity(ids.len());
        for batch in ids.chunks(IN_BATCH) {
            let sql = match scope {
                Some(_) => format!(
                    "SELECT c.id FROM chunks c JOIN files f ON f.id = c.file_id \
                     WHERE f.corpus = ? AND c.vector IS NOT NULL AND c.id IN ({})",
                    placeholders(batch.len())
                ),
                None => format!(
                    "SELECT id FROM tags WHERE vector IS NOT NULL AND id IN ({})",
                    placeholders(batch.len())
                ),
            };
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            if let Some(corpus) = scope {
                query = query.bind(corpus);
            }
            for id in batch {
                query = query.bind(*id);
            }
            live.extend(query.fetch_all(&self.pool).await?);
        }
        Ok(live)
    }

    /// Pairwise tag co-occurrence counts over shared files, `tag_a < tag_b`.
    pub async fn tag_cooccurrence(&self) -> Result<Vec<(i64, i64, i64)>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT ft1.tag_id AS tag1, ft2.tag_id AS tag2, COUNT(ft1.file_id) AS weight \
             FROM file_tags ft1 \
             JOIN file_tags ft2 ON ft1.file_id = ft2.file_id AND ft1.tag_id < ft2.tag_id \
             GROUP BY ft1.tag_id, ft2.tag_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("tag1"), row.get("tag2"), row.get("weight")))
            .collect())
    }

    /// All tags that carry a vector.
    pub async fn all_tags(&self) -> Result<Vec<TagRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT id, name, vector FROM tags WHERE vector IS NOT NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_tag).collect())
    }

    pub async fn tags_by_names(&self, names: &[String]) -> Result<Vec<TagRecord>, sqlx::Error> {
        let mut out = Vec::new();
        for batch in names.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT id, name, vector FROM tags WHERE lower(name) IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for name in batch {
                query = query.bind(name.to_lowercase());
            }
            for row in query.fetch_all(&self.pool).await? {
                out.push(row_to_tag(&row));
            }
        }
        Ok(out)
    }

    /// Tag names linked to each chunk's file.
    pub async fn tags_for_chunks(&self, ids: &[i64]) -> Result<HashMap<i64, Vec<String>>, sqlx::Error> {
        let mut out: HashMap<i64, Vec<String>> = HashMap::new();
        for batch in ids.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT c.id AS chunk_id, t.name AS name FROM chunks c \
                 JOIN file_tags ft ON ft.file_id = c.file_id \
                 JOIN tags t ON t.id = ft.tag_id \
                 WHERE c.id IN ({}) ORDER BY t.name",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                out.entry(row.get("chunk_id"))
                    .or_default()
                    .push(row.get("name"));
            }
        }
        Ok(out)
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<KvEntry>, sqlx::Error> {
        let row = sqlx::query("SELECT key, value, vector FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let blob: Option<Vec<u8>> = row.get("vector");
            KvEntry {
                key: row.get("key"),
                value: row.get("value"),
                vector: blob.map(|b| blob_to_vec(&b)),
            }
        }))
    }

    pub async fn kv_put(&self, entry: &KvEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO kv_store (key, value, vector) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, vector = excluded.vector",
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(entry.vector.as_deref().map(vec_to_blob))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats, sqlx::Error> {
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            files,
            chunks,
            tags,
            corpora: self.corpora().await?,
        })
    }
}
