//! Symmetric tag co-occurrence counts.

use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct CooccurrenceMatrix {
    weights: HashMap<i64, HashMap<i64, f32>>,
}

impl CooccurrenceMatrix {
    /// Build from `(tag_a, tag_b, count)` rows, one row per unordered pair.
    pub fn from_pairs(pairs: &[(i64, i64, i64)]) -> Self {
        let mut weights: HashMap<i64, HashMap<i64, f32>> = HashMap::new();
        for &(a, b, count) in pairs {
            if a == b {
                continue;
            }
            *weights.entry(a).or_default().entry(b).or_default() += count as f32;
            *weights.entry(b).or_default().entry(a).or_default() += count as f32;
        }
        Self { weights }
    }

    pub fn weight(&self, a: i64, b: i64) -> f32 {
        self.weights
            .get(&a)
            .and_then(|row| row.get(&b))
            .copied()
            .unwrap_or(0.0)
    }

    /// The `n` tags most often seen alongside `tag`, strongest first.
    pub fn top_related(&self, tag: i64, n: usize) -> Vec<(i64, f32)> {
        let Some(row) = self.weights.get(&tag) else {
            return Vec::new();
        };
        let mut related: Vec<(i64, f32)> = row.iter().map(|(&id, &w)| (id, w)).collect();
        related.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        related.truncate(n);
        related
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_and_ranked() {
        let m = CooccurrenceMatrix::from_pairs(&[(1, 2, 5), (1, 3, 2), (2, 3, 7), (1, 4, 5)]);
        assert_eq!(m.weight(1, 2), 5.0);
        assert_eq!(m.weight(2, 1), 5.0);
        assert_eq!(m.weight(3, 4), 0.0);
        assert_eq!(m.top_related(1, 2), vec![(2, 5.0), (4, 5.0)]);
        assert!(m.top_related(99, 4).is_empty());
    }
}
