//! Conversation context window.
//!
//! Holds the vectors of recent conversation turns (oldest first) and derives
//! two things from them: the semantic width of a query against that history,
//! and topic segments whose centroids feed the multi-vector query.

use crate::vector::{cosine_similarity, normalize, normalized};

/// Consecutive turns at least this similar belong to one segment.
pub const SEGMENT_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    vectors: Vec<Vec<f32>>,
}

impl ContextWindow {
    pub fn new(vectors: Vec<Vec<f32>>) -> Self {
        Self {
            vectors: vectors.iter().map(|v| normalized(v)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Spread of the query plus history in `[0, 1]`: one minus the length of
    /// the mean unit vector. Zero without history.
    pub fn semantic_width(&self, query: &[f32]) -> f32 {
        if self.vectors.is_empty() {
            return 0.0;
        }
        let query = normalized(query);
        let mut mean = query.clone();
        for v in &self.vectors {
            if v.len() != mean.len() {
                continue;
            }
            for (m, x) in mean.iter_mut().zip(v) {
                *m += x;
            }
        }
        let n = (self.vectors.len() + 1) as f32;
        let len = mean.iter().map(|x| (x / n) * (x / n)).sum::<f32>().sqrt();
        (1.0 - len).clamp(0.0, 1.0)
    }

    /// Group consecutive turns into topic segments. Returns one unit
    /// centroid per segment, oldest first.
    pub fn segments(&self, threshold: f32) -> Vec<Vec<f32>> {
        let mut segments: Vec<(Vec<f32>, usize)> = Vec::new();
        for v in &self.vectors {
            let joins = segments
                .last()
                .is_some_and(|(sum, _)| sum.len() == v.len() && cosine_similarity(sum, v) >= threshold);
            match segments.last_mut() {
                Some((sum, count)) if joins => {
                    for (s, x) in sum.iter_mut().zip(v) {
                        *s += x;
                    }
                    *count += 1;
                }
                _ => segments.push((v.clone(), 1)),
            }
        }
        segments
            .into_iter()
            .map(|(mut sum, _)| {
                normalize(&mut sum);
                sum
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_zero_without_history() {
        assert_eq!(ContextWindow::default().semantic_width(&[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_width_grows_with_spread() {
        let narrow = ContextWindow::new(vec![vec![1.0, 0.0], vec![0.99, 0.05]]);
        let wide = ContextWindow::new(vec![vec![0.0, 1.0], vec![-1.0, 0.0]]);
        let q = [1.0, 0.0];
        assert!(narrow.semantic_width(&q) < 0.01);
        assert!(wide.semantic_width(&q) > 0.5);
    }

    #[test]
    fn test_segments_split_on_topic_change() {
        let window = ContextWindow::new(vec![
            vec![1.0, 0.0],
            vec![0.95, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.95],
            vec![1.0, 0.0],
        ]);
        let segments = window.segments(SEGMENT_THRESHOLD);
        assert_eq!(segments.len(), 3);
        assert!(segments[0][0] > 0.9);
        assert!(segments[1][1] > 0.9);
    }
}
