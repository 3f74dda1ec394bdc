//! Residual pyramid: peel a query vector into tag contributions.
//!
//! Each level searches the tag index with the current residual, records
//! every hit as a candidate, and subtracts the projection of the strongest
//! tag. The loop stops once the explained energy `1 - |r|²` reaches the
//! configured fraction, when no tag still points along the residual, or
//! after `max_levels`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::index::IndexHit;
use crate::vector::{dot, normalized};

/// Hits fetched from the tag index per level.
pub const HITS_PER_LEVEL: usize = 8;

#[derive(Debug, Clone)]
pub struct PyramidCandidate {
    pub tag_id: i64,
    pub level: usize,
    /// Squared positive projection of the residual onto the tag.
    pub contribution: f32,
    /// Cosine similarity between the tag and the residual at that level.
    pub similarity: f32,
}

#[derive(Debug, Clone, Default)]
pub struct PyramidResult {
    pub candidates: Vec<PyramidCandidate>,
    /// Fraction of query energy explained by the peeled tags.
    pub coverage: f32,
    /// How far the query is from its nearest tag.
    pub novelty: f32,
    pub depth: usize,
}

/// Decompose `query`.
///
/// `search` queries the tag index; `vectors` supplies tag vectors by id
/// (tags missing there are ignored).
pub fn decompose<F>(
    query: &[f32],
    vectors: &HashMap<i64, Vec<f32>>,
    max_levels: usize,
    energy_target: f32,
    mut search: F,
) -> PyramidResult
where
    F: FnMut(&[f32], usize) -> Vec<IndexHit>,
{
    let mut residual = normalized(query);
    let mut result = PyramidResult {
        novelty: 1.0,
        ..Default::default()
    };
    // First level at which a tag appeared wins
    let mut seen: HashMap<i64, usize> = HashMap::new();
    let mut explained = 0.0f32;

    for level in 0..max_levels {
        let hits = search(&residual, HITS_PER_LEVEL);
        if hits.is_empty() {
            break;
        }
        if level == 0 {
            result.novelty = (1.0 - hits[0].score).clamp(0.0, 1.0);
        }
        result.depth = level + 1;

        let mut best: Option<(i64, f32)> = None;
        for hit in &hits {
            let Some(tag) = vectors.get(&hit.id) else {
                continue;
            };
            let tag = normalized(tag);
            let projection = dot(&residual, &tag);
            let contribution = projection.max(0.0).powi(2);
            if contribution <= 0.0 {
                continue;
            }

            if let Entry::Vacant(slot) = seen.entry(hit.id) {
                slot.insert(result.candidates.len());
                result.candidates.push(PyramidCandidate {
                    tag_id: hit.id,
                    level,
                    contribution,
                    similarity: hit.score,
                });
            }

            if best.map_or(true, |(_, p)| projection > p) {
                best = Some((hit.id, projection));
            }
        }

        let Some((best_id, projection)) = best else {
            break;
        };
        if let Some(tag) = vectors.get(&best_id) {
            let tag = normalized(tag);
            for (r, t) in residual.iter_mut().zip(tag.iter()) {
                *r -= projection * t;
            }
        }

        explained = (1.0 - dot(&residual, &residual)).clamp(0.0, 1.0);
        if explained >= energy_target {
            break;
        }
    }

    result.coverage = explained;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FlatIndex, VectorIndex};

    fn setup(tags: &[(i64, [f32; 3])]) -> (FlatIndex, HashMap<i64, Vec<f32>>) {
        let mut index = FlatIndex::new(3, 100);
        let mut vectors = HashMap::new();
        for (id, v) in tags {
            index.add(*id, v).unwrap();
            vectors.insert(*id, v.to_vec());
        }
        (index, vectors)
    }

    #[test]
    fn test_exact_tag_fully_explained() {
        let (index, vectors) = setup(&[(1, [1.0, 0.0, 0.0]), (2, [0.0, 1.0, 0.0])]);
        let result = decompose(&[1.0, 0.0, 0.0], &vectors, 4, 0.9, |q, k| {
            index.search(q, k).unwrap()
        });
        assert_eq!(result.depth, 1);
        assert!((result.coverage - 1.0).abs() < 1e-5);
        assert!(result.novelty.abs() < 1e-5);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].tag_id, 1);
    }

    #[test]
    fn test_mixed_query_peels_levels() {
        let (index, vectors) = setup(&[(1, [1.0, 0.0, 0.0]), (2, [0.0, 1.0, 0.0])]);
        let query = [0.8, 0.6, 0.0];
        let result = decompose(&query, &vectors, 4, 0.99, |q, k| index.search(q, k).unwrap());

        assert_eq!(result.depth, 2);
        assert!(result.coverage > 0.99);
        let first = &result.candidates[0];
        assert_eq!(first.tag_id, 1);
        assert!((first.contribution - 0.64).abs() < 1e-4);
        assert!(result.candidates.iter().any(|c| c.tag_id == 2));
    }

    #[test]
    fn test_no_tags() {
        let vectors = HashMap::new();
        let result = decompose(&[1.0, 0.0], &vectors, 4, 0.9, |_, _| Vec::new());
        assert!(result.candidates.is_empty());
        assert_eq!(result.coverage, 0.0);
        assert_eq!(result.novelty, 1.0);
    }
}
