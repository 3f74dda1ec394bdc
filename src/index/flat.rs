//! Exact (brute-force) cosine index with a checksummed on-disk format.
//!
//! File layout, all integers little-endian:
//!
//! ```text
//! "VIDX" | version u32 | dims u32 | count u64 | count × (id i64, dims × f32) | sha256 (32 bytes)
//! ```
//!
//! The trailing digest covers every preceding byte. Any truncation, bit
//! flip or header mismatch is reported as [`IndexError::Corrupt`].

use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use super::{IndexError, IndexFactory, IndexHit, VectorIndex};
use crate::vector;

const MAGIC: &[u8; 4] = b"VIDX";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const DIGEST_LEN: usize = 32;

pub struct FlatIndex {
    dims: usize,
    capacity: usize,
    /// Stored unit-normalized so search is a plain dot product.
    entries: HashMap<i64, Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dims: usize, capacity: usize) -> Self {
        Self {
            dims,
            capacity,
            entries: HashMap::new(),
        }
    }

    fn check_dims(&self, actual: usize) -> Result<(), IndexError> {
        if actual != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual,
            });
        }
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        let mut ids: Vec<i64> = self.entries.keys().copied().collect();
        ids.sort_unstable();

        let mut buf = Vec::with_capacity(HEADER_LEN + ids.len() * (8 + self.dims * 4) + DIGEST_LEN);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.dims as u32).to_le_bytes());
        buf.extend_from_slice(&(ids.len() as u64).to_le_bytes());
        for id in ids {
            buf.extend_from_slice(&id.to_le_bytes());
            if let Some(v) = self.entries.get(&id) {
                buf.extend_from_slice(&vector::vec_to_blob(v));
            }
        }
        let digest = Sha256::digest(&buf);
        buf.extend_from_slice(&digest);
        buf
    }

    fn decode(bytes: &[u8], dims: usize, capacity: usize) -> Result<Self, IndexError> {
        if bytes.len() < HEADER_LEN + DIGEST_LEN {
            return Err(IndexError::Corrupt("file too short".to_string()));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(IndexError::Corrupt("checksum mismatch".to_string()));
        }
        if &body[0..4] != MAGIC {
            return Err(IndexError::Corrupt("bad magic".to_string()));
        }

        let version = read_u32(body, 4);
        if version != VERSION {
            return Err(IndexError::Corrupt(format!("unsupported version {}", version)));
        }
        let file_dims = read_u32(body, 8) as usize;
        if file_dims != dims {
            return Err(IndexError::DimensionMismatch {
                expected: dims,
                actual: file_dims,
            });
        }
        let count = read_u64(body, 12) as usize;
        let entry_len = 8 + dims * 4;
        if body.len() != HEADER_LEN + count * entry_len {
            return Err(IndexError::Corrupt(format!(
                "expected {} entries, payload is {} bytes",
                count,
                body.len() - HEADER_LEN
            )));
        }

        let mut entries = HashMap::with_capacity(count);
        for raw in body[HEADER_LEN..].chunks_exact(entry_len) {
            let id = i64::from_le_bytes(
                raw[0..8]
                    .try_into()
                    .map_err(|_| IndexError::Corrupt("truncated id".to_string()))?,
            );
            entries.insert(id, vector::blob_to_vec(&raw[8..]));
        }

        Ok(Self {
            dims,
            capacity: capacity.max(entries.len()),
            entries,
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl VectorIndex for FlatIndex {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    fn add(&mut self, id: i64, vector: &[f32]) -> Result<(), IndexError> {
        self.check_dims(vector.len())?;
        if self.entries.contains_key(&id) {
            return Err(IndexError::Duplicate(id));
        }
        if self.entries.len() >= self.capacity {
            return Err(IndexError::CapacityExceeded(self.capacity));
        }
        self.entries.insert(id, vector::normalized(vector));
        Ok(())
    }

    fn remove(&mut self, id: i64) -> bool {
        self.entries.remove(&id).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        self.check_dims(query.len())?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let q = vector::normalized(query);
        let mut hits: Vec<IndexHit> = self
            .entries
            .iter()
            .map(|(&id, v)| IndexHit {
                id,
                score: vector::dot(&q, v),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn save(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("vidx.tmp");
        std::fs::write(&tmp, self.encode())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Factory for [`FlatIndex`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatIndexFactory;

impl IndexFactory for FlatIndexFactory {
    fn create(&self, dims: usize, capacity: usize) -> Box<dyn VectorIndex> {
        Box::new(FlatIndex::new(dims, capacity))
    }

    fn load(
        &self,
        path: &Path,
        dims: usize,
        capacity: usize,
    ) -> Result<Box<dyn VectorIndex>, IndexError> {
        let bytes = std::fs::read(path)?;
        Ok(Box::new(FlatIndex::decode(&bytes, dims, capacity)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> FlatIndex {
        let mut index = FlatIndex::new(3, 100);
        index.add(1, &[1.0, 0.0, 0.0]).unwrap();
        index.add(2, &[0.7, 0.7, 0.0]).unwrap();
        index.add(3, &[0.0, 0.0, 1.0]).unwrap();
        index.add(4, &[0.2, 0.9, 0.1]).unwrap();
        index
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let index = sample();
        let hits = index.search(&[1.0, 0.1, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[1].id, 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut index = sample();
        assert!(matches!(
            index.add(1, &[0.0, 1.0, 0.0]),
            Err(IndexError::Duplicate(1))
        ));
    }

    #[test]
    fn test_capacity_enforced() {
        let mut index = FlatIndex::new(2, 1);
        index.add(1, &[1.0, 0.0]).unwrap();
        assert!(matches!(
            index.add(2, &[0.0, 1.0]),
            Err(IndexError::CapacityExceeded(1))
        ));
    }

    #[test]
    fn test_save_load_identical_topk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("corpus.vidx");
        let index = sample();
        index.save(&path).unwrap();

        let loaded = FlatIndexFactory.load(&path, 3, 100).unwrap();
        assert_eq!(loaded.len(), 4);

        let queries: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.1, 1.0, 0.0], [0.3, 0.3, 0.9]];
        for query in queries.iter() {
            let before = index.search(query, 3).unwrap();
            let after = loaded.search(query, 3).unwrap();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_load_detects_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("corpus.vidx");
        sample().save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_LEN + 3] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            FlatIndexFactory.load(&path, 3, 100),
            Err(IndexError::Corrupt(_))
        ));
    }

    #[test]
    fn test_load_rejects_wrong_dims() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("corpus.vidx");
        sample().save(&path).unwrap();
        assert!(matches!(
            FlatIndexFactory.load(&path, 4, 100),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }
}
