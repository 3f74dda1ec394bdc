//! Semantic axes over the tag space and signal projection.
//!
//! Axes are the centroids of a deterministic spherical k-means over all tag
//! vectors. Projecting a query onto them gives a probability mass per axis,
//! from which the three query signals are read:
//!
//! - **entropy**: normalized Shannon entropy of the mass, `H / ln K`
//! - **logic depth**: `1 - entropy`; a query concentrated on one axis is "deep"
//! - **resonance**: mass shared between dissimilar active axes

use serde::Serialize;
use std::cmp::Ordering;

use crate::vector::{cosine_similarity, dot, normalize, normalized};

const MAX_AXES: usize = 8;
const ITERATIONS: usize = 10;
/// Minimum mass for an axis to count towards resonance.
const ACTIVE_MASS: f32 = 0.1;
const DOMINANT: usize = 3;

/// World reported when no axis could be fitted.
pub const UNKNOWN_WORLD: &str = "Unknown";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AxisWeight {
    pub label: String,
    pub weight: f32,
}

/// Signals extracted from one query vector.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SignalAnalysis {
    pub logic_depth: f32,
    pub entropy: f32,
    pub resonance: f32,
    pub dominant_axes: Vec<AxisWeight>,
    /// Label of the strongest axis.
    pub world: String,
}

impl Default for SignalAnalysis {
    fn default() -> Self {
        Self {
            logic_depth: 0.5,
            entropy: 0.5,
            resonance: 0.0,
            dominant_axes: Vec::new(),
            world: UNKNOWN_WORLD.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Axis {
    pub label: String,
    pub centroid: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct AxisModel {
    axes: Vec<Axis>,
}

impl AxisModel {
    /// Fit axes to `tags` (name, vector). Input order decides ties, so the
    /// result is stable for a stable input.
    pub fn fit(tags: &[(String, Vec<f32>)]) -> Self {
        let points: Vec<(&str, Vec<f32>)> = tags
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(name, v)| (name.as_str(), normalized(v)))
            .collect();
        if points.is_empty() {
            return Self::default();
        }
        let k = points.len().min(MAX_AXES);

        // Farthest-point initialization
        let mut centroids: Vec<Vec<f32>> = vec![points[0].1.clone()];
        while centroids.len() < k {
            let next = points
                .iter()
                .enumerate()
                .map(|(i, (_, p))| {
                    let nearest = centroids
                        .iter()
                        .map(|c| dot(p, c))
                        .fold(f32::NEG_INFINITY, f32::max);
                    (i, nearest)
                })
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)))
                .map(|(i, _)| i)
                .unwrap_or(0);
            centroids.push(points[next].1.clone());
        }

        let dims = points[0].1.len();
        for _ in 0..ITERATIONS {
            let mut sums = vec![vec![0.0f32; dims]; k];
            let mut counts = vec![0usize; k];
            for (_, p) in &points {
                let best = nearest_centroid(p, &centroids);
                for (s, x) in sums[best].iter_mut().zip(p.iter()) {
                    *s += x;
                }
                counts[best] += 1;
            }
            for (i, sum) in sums.iter_mut().enumerate() {
                if counts[i] > 0 {
                    normalize(sum);
                    centroids[i] = std::mem::take(sum);
                }
            }
        }

        let axes = centroids
            .into_iter()
            .map(|centroid| {
                let label = points
                    .iter()
                    .max_by(|a, b| {
                        dot(&a.1, &centroid)
                            .partial_cmp(&dot(&b.1, &centroid))
                            .unwrap_or(Ordering::Equal)
                    })
                    .map(|(name, _)| name.to_string())
                    .unwrap_or_default();
                Axis { label, centroid }
            })
            .collect();

        Self { axes }
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn project(&self, query: &[f32]) -> SignalAnalysis {
        if self.axes.is_empty() {
            return SignalAnalysis::default();
        }

        let energies: Vec<f32> = self
            .axes
            .iter()
            .map(|a| cosine_similarity(query, &a.centroid).powi(2))
            .collect();
        let total: f32 = energies.iter().sum();
        if total <= f32::EPSILON {
            return SignalAnalysis::default();
        }
        let mass: Vec<f32> = energies.iter().map(|e| e / total).collect();

        let k = mass.len();
        let entropy = if k > 1 {
            let h: f32 = mass
                .iter()
                .filter(|p| **p > 0.0)
                .map(|p| -p * p.ln())
                .sum();
            (h / (k as f32).ln()).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut resonance = 0.0;
        for i in 0..k {
            for j in (i + 1)..k {
                if mass[i] >= ACTIVE_MASS && mass[j] >= ACTIVE_MASS {
                    let overlap =
                        cosine_similarity(&self.axes[i].centroid, &self.axes[j].centroid).abs();
                    resonance += (mass[i] * mass[j]).sqrt() * (1.0 - overlap);
                }
            }
        }

        let mut ranked: Vec<usize> = (0..k).collect();
        ranked.sort_by(|a, b| {
            mass[*b]
                .partial_cmp(&mass[*a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(b))
        });
        let dominant_axes: Vec<AxisWeight> = ranked
            .iter()
            .take(DOMINANT)
            .map(|&i| AxisWeight {
                label: self.axes[i].label.clone(),
                weight: mass[i],
            })
            .collect();
        let world = dominant_axes
            .first()
            .map(|a| a.label.clone())
            .unwrap_or_else(|| UNKNOWN_WORLD.to_string());

        SignalAnalysis {
            logic_depth: 1.0 - entropy,
            entropy,
            resonance,
            dominant_axes,
            world,
        }
    }
}

fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, dot(point, c)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(b.0.cmp(&a.0)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, v: &[f32]) -> (String, Vec<f32>) {
        (name.to_string(), v.to_vec())
    }

    #[test]
    fn test_no_tags_gives_defaults() {
        let model = AxisModel::fit(&[]);
        assert_eq!(model.project(&[1.0, 0.0]), SignalAnalysis::default());
    }

    #[test]
    fn test_focused_query_is_deep() {
        let model = AxisModel::fit(&[
            tag("rust", &[1.0, 0.0, 0.0]),
            tag("cooking", &[0.0, 1.0, 0.0]),
            tag("history", &[0.0, 0.0, 1.0]),
        ]);
        assert_eq!(model.axes().len(), 3);

        let focused = model.project(&[1.0, 0.0, 0.0]);
        assert!(focused.logic_depth > 0.99);
        assert!(focused.entropy < 0.01);
        assert_eq!(focused.world, "rust");
        assert!(focused.resonance.abs() < 1e-6);

        let spread = model.project(&[1.0, 1.0, 1.0]);
        assert!(spread.entropy > 0.99);
        assert!(spread.resonance > 0.5);
        assert_eq!(spread.dominant_axes.len(), 3);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let tags: Vec<(String, Vec<f32>)> = (0..20)
            .map(|i| {
                let a = i as f32 * 0.3;
                tag(&format!("t{}", i), &[a.cos(), a.sin(), 0.1])
            })
            .collect();
        let a = AxisModel::fit(&tags);
        let b = AxisModel::fit(&tags);
        let labels_a: Vec<&str> = a.axes().iter().map(|x| x.label.as_str()).collect();
        let labels_b: Vec<&str> = b.axes().iter().map(|x| x.label.as_str()).collect();
        assert_eq!(labels_a, labels_b);
        assert_eq!(a.axes().len(), 8);
    }
}
