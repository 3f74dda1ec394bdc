//! Tag signal engine: query signals, tag boosting and context fusion.
//!
//! Given a query vector, [`TagSignalEngine::apply_tag_boost`] runs:
//!
//! 1. **Signal projection** onto the tag axes ([`axes`]) for logic depth,
//!    entropy, resonance and the dominant "world".
//! 2. **Residual pyramid** ([`pyramid`]) for candidate tags, coverage and
//!    novelty. Level `i` candidates decay by `0.7^i`.
//! 3. **Weight adjustment** per candidate: a language-confidence penalty for
//!    ASCII technical tokens outside technical worlds, and the spotlight
//!    boost for caller-nominated core tags.
//! 4. **Co-occurrence pull-back** ([`cooccurrence`]): each of the top 5
//!    candidates brings its 4 most frequent companions at half weight.
//! 5. **Core injection**: nominated tags that did not surface are added as
//!    virtual candidates.
//! 6. **Dedup** of near-identical tags, then a weighted average into a
//!    context vector that is blended into the query.
//!
//! The tag catalog, axes and co-occurrence matrix are rebuilt by
//! [`TagSignalEngine::refresh`] and swapped in atomically.

pub mod axes;
pub mod cooccurrence;
pub mod pyramid;

use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::debug;

pub use axes::{AxisModel, AxisWeight, SignalAnalysis, UNKNOWN_WORLD};
pub use cooccurrence::CooccurrenceMatrix;

use crate::chunk::is_cjk;
use crate::config::TagsConfig;
use crate::error::{EngineError, EngineResult};
use crate::registry::IndexRegistry;
use crate::store::RelationalStore;
use crate::vector::{cosine_similarity, normalize, normalized, weighted_average};

const LEVEL_DECAY: f32 = 0.7;
const PULLBACK_PARENTS: usize = 5;
const PULLBACK_CHILDREN: usize = 4;
const PULLBACK_SHARE: f32 = 0.5;
const DEDUP_ABSORB: f32 = 0.2;
const DYNAMIC_BOOST_MIN: f32 = 0.3;
const DYNAMIC_BOOST_MAX: f32 = 2.0;
/// Share of the top weight a tag needs to be reported as matched.
const TECHNICAL_VISIBILITY: f32 = 0.08;
const TAG_VISIBILITY: f32 = 0.015;

static TECHNICAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-_.\s]+$").expect("static regex"));

/// An ASCII-only token like `tokio` or `k8s-ingress`.
pub fn is_technical(name: &str) -> bool {
    !name.chars().any(is_cjk) && name.chars().count() > 3 && TECHNICAL_RE.is_match(name)
}

/// Down-weight a technical tag when the query's world is not technical.
fn language_penalty(config: &TagsConfig, name: &str, world: &str) -> f32 {
    if !is_technical(name) {
        return 1.0;
    }
    let world_lower = world.to_lowercase();
    let matches_any = |list: &[String]| list.iter().any(|w| world_lower.contains(&w.to_lowercase()));

    let known = world != UNKNOWN_WORLD;
    if known && (is_technical(world) || matches_any(&config.technical_worlds)) {
        return 1.0;
    }

    let base = if known {
        config.lang_penalty_cross_domain
    } else {
        config.lang_penalty_unknown
    };
    if matches_any(&config.social_worlds) {
        base.sqrt()
    } else {
        base
    }
}

fn lerp(range: [f32; 2], t: f32) -> f32 {
    range[0] + (range[1] - range[0]) * t.clamp(0.0, 1.0)
}

/// Parameters for one tag-boost call.
#[derive(Debug, Clone, Default)]
pub struct BoostRequest {
    pub vector: Vec<f32>,
    /// Blend factor for the context vector before dynamic scaling.
    pub weight: f32,
    /// Spotlight tags that must be boosted.
    pub core_tags: Vec<String>,
    /// Overrides the dynamic spotlight multiplier.
    pub core_boost_factor: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightedTag {
    pub id: i64,
    pub name: String,
    pub weight: f32,
    pub level: usize,
    pub is_core: bool,
    /// Injected from the core list rather than found by the pyramid.
    pub is_virtual: bool,
    pub is_technical: bool,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BoostInfo {
    pub matched_tags: Vec<String>,
    pub core_tags_matched: Vec<String>,
    /// Effective blend weight applied to the context vector.
    pub boost_factor: f32,
    pub core_boost_factor: f32,
    pub activation: f32,
    pub coverage: f32,
    pub novelty: f32,
    pub depth: usize,
    /// Sum of matched tag weights relative to the strongest tag.
    pub tag_match_score: f32,
    pub signals: SignalAnalysis,
    pub tags: Vec<WeightedTag>,
}

impl BoostInfo {
    /// Matched tags with their weight relative to the strongest tag.
    pub fn relative_weights(&self) -> HashMap<&str, f32> {
        let max = self.tags.iter().map(|t| t.weight).fold(0.0f32, f32::max);
        let matched: HashSet<&str> = self.matched_tags.iter().map(String::as_str).collect();
        self.tags
            .iter()
            .filter(|t| matched.contains(t.name.as_str()))
            .map(|t| {
                let w = if max > 0.0 { t.weight / max } else { 0.0 };
                (t.name.as_str(), w)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct TagBoost {
    pub vector: Vec<f32>,
    pub info: BoostInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagMatch {
    pub name: String,
    pub score: f32,
}

#[derive(Default)]
struct TagState {
    names: HashMap<i64, String>,
    vectors: HashMap<i64, Vec<f32>>,
    /// Lowercased name to id.
    by_name: HashMap<String, i64>,
    axes: AxisModel,
    cooccurrence: CooccurrenceMatrix,
}

pub struct TagSignalEngine {
    config: TagsConfig,
    registry: IndexRegistry,
    store: RelationalStore,
    state: RwLock<Arc<TagState>>,
}

impl TagSignalEngine {
    pub fn new(config: TagsConfig, registry: IndexRegistry, store: RelationalStore) -> Self {
        Self {
            config,
            registry,
            store,
            state: RwLock::new(Arc::new(TagState::default())),
        }
    }

    fn state(&self) -> Arc<TagState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reload the tag catalog and rebuild axes and co-occurrence.
    pub async fn refresh(&self) -> EngineResult<()> {
        let tags = self.store.all_tags().await?;
        let pairs = self.store.tag_cooccurrence().await?;

        let dims = self.registry.dims();
        let mut state = TagState::default();
        let mut fit_input = Vec::with_capacity(tags.len());
        for tag in tags {
            let Some(vector) = tag.vector else { continue };
            if vector.len() != dims {
                continue;
            }
            fit_input.push((tag.name.clone(), vector.clone()));
            state.by_name.insert(tag.name.to_lowercase(), tag.id);
            state.names.insert(tag.id, tag.name);
            state.vectors.insert(tag.id, vector);
        }
        state.axes = AxisModel::fit(&fit_input);
        state.cooccurrence = CooccurrenceMatrix::from_pairs(&pairs);

        debug!(
            tags = state.names.len(),
            axes = state.axes.axes().len(),
            pairs = pairs.len(),
            "Refreshed tag signals"
        );
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
        Ok(())
    }

    pub fn tag_count(&self) -> usize {
        self.state().names.len()
    }

    fn check_dims(&self, vector: &[f32]) -> EngineResult<()> {
        let expected = self.registry.dims();
        if vector.len() != expected {
            return Err(EngineError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Logic depth, entropy, resonance and dominant axes of `vector`.
    pub fn analyze(&self, vector: &[f32]) -> EngineResult<SignalAnalysis> {
        self.check_dims(vector)?;
        Ok(self.state().axes.project(vector))
    }

    /// Nearest tags to `vector` by cosine similarity.
    pub fn search_similar_tags(&self, vector: &[f32], k: usize) -> EngineResult<Vec<TagMatch>> {
        self.check_dims(vector)?;
        let state = self.state();
        let hits = self.registry.search_tags(vector, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                state.names.get(&hit.id).map(|name| TagMatch {
                    name: name.clone(),
                    score: hit.score,
                })
            })
            .collect())
    }

    /// Boost `request.vector` towards the tags it resonates with.
    pub async fn apply_tag_boost(&self, request: &BoostRequest) -> EngineResult<TagBoost> {
        self.check_dims(&request.vector)?;
        let config = &self.config;
        let query = normalized(&request.vector);
        let state = self.state();

        let signals = state.axes.project(&query);
        let registry = &self.registry;
        let pyramid = pyramid::decompose(
            &query,
            &state.vectors,
            config.pyramid_max_levels,
            config.pyramid_energy,
            |residual, k| registry.search_tags(residual, k).unwrap_or_default(),
        );

        let logic = signals.logic_depth;
        let activation = pyramid.coverage * (1.0 - 0.5 * pyramid.novelty);
        let dynamic = (logic * (1.0 + (1.0 + signals.resonance).ln()))
            / (1.0 + 0.5 * signals.entropy)
            * lerp(config.activation_range, activation);
        let boost_factor = (request.weight * dynamic.clamp(DYNAMIC_BOOST_MIN, DYNAMIC_BOOST_MAX))
            .clamp(0.0, 1.0);
        let core_factor = request.core_boost_factor.unwrap_or_else(|| {
            lerp(
                config.core_boost_range,
                0.5 * logic + 0.5 * (1.0 - pyramid.coverage),
            )
        });
        let core_set: HashSet<String> = request.core_tags.iter().map(|t| t.to_lowercase()).collect();

        let mut tags: Vec<WeightedTag> = pyramid
            .candidates
            .iter()
            .filter_map(|c| {
                let name = state.names.get(&c.tag_id)?;
                let vector = state.vectors.get(&c.tag_id)?;
                let is_core = core_set.contains(&name.to_lowercase());
                let spotlight = if is_core {
                    core_factor * (0.95 + cosine_similarity(&query, vector) * 0.1)
                } else {
                    1.0
                };
                let weight = c.contribution
                    * LEVEL_DECAY.powi(c.level as i32)
                    * language_penalty(config, name, &signals.world)
                    * spotlight;
                Some(WeightedTag {
                    id: c.tag_id,
                    name: name.clone(),
                    weight,
                    level: c.level,
                    is_core,
                    is_virtual: false,
                    is_technical: is_technical(name),
                    vector: vector.clone(),
                })
            })
            .collect();
        sort_by_weight(&mut tags);
        tags.truncate(config.expand_max);

        // Co-occurrence pull-back
        let mut present: HashSet<i64> = tags.iter().map(|t| t.id).collect();
        let parents: Vec<(i64, f32, usize)> = tags
            .iter()
            .take(PULLBACK_PARENTS)
            .map(|t| (t.id, t.weight, t.level))
            .collect();
        for (parent, weight, level) in parents {
            for (related, _) in state.cooccurrence.top_related(parent, PULLBACK_CHILDREN) {
                let (Some(name), Some(vector)) =
                    (state.names.get(&related), state.vectors.get(&related))
                else {
                    continue;
                };
                if !present.insert(related) {
                    continue;
                }
                tags.push(WeightedTag {
                    id: related,
                    name: name.clone(),
                    weight: weight * PULLBACK_SHARE,
                    level: level + 1,
                    is_core: core_set.contains(&name.to_lowercase()),
                    is_virtual: false,
                    is_technical: is_technical(name),
                    vector: vector.clone(),
                });
            }
        }

        // Spotlight tags that did not surface on their own
        let surfaced: HashSet<String> = tags.iter().map(|t| t.name.to_lowercase()).collect();
        let missing: Vec<String> = request
            .core_tags
            .iter()
            .filter(|name| !surfaced.contains(&name.to_lowercase()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let top = tags.iter().map(|t| t.weight).fold(0.0f32, f32::max);
            let virtual_weight = if top > 0.0 { top } else { 1.0 } * core_factor;
            for (id, name, vector) in self.lookup_tags(&state, &missing).await? {
                if !present.insert(id) {
                    continue;
                }
                tags.push(WeightedTag {
                    id,
                    is_technical: is_technical(&name),
                    name,
                    weight: virtual_weight,
                    level: 0,
                    is_core: true,
                    is_virtual: true,
                    vector,
                });
            }
        }

        let tags = dedup_tags(tags, config.dedup_threshold);

        let mut info = BoostInfo {
            boost_factor,
            core_boost_factor: core_factor,
            activation,
            coverage: pyramid.coverage,
            novelty: pyramid.novelty,
            depth: pyramid.depth,
            signals,
            ..Default::default()
        };

        let weighted: Vec<(&[f32], f32)> = tags
            .iter()
            .map(|t| (t.vector.as_slice(), t.weight))
            .collect();
        let Some(mut context) = weighted_average(&weighted) else {
            return Ok(TagBoost {
                vector: query,
                info,
            });
        };
        normalize(&mut context);

        let mut fused: Vec<f32> = query
            .iter()
            .zip(context.iter())
            .map(|(q, c)| (1.0 - boost_factor) * q + boost_factor * c)
            .collect();
        normalize(&mut fused);

        let max = tags.iter().map(|t| t.weight).fold(0.0f32, f32::max);
        for tag in &tags {
            let visible = if tag.is_technical {
                tag.weight > max * TECHNICAL_VISIBILITY
            } else {
                tag.weight > max * TAG_VISIBILITY
            };
            if tag.is_core || visible {
                info.matched_tags.push(tag.name.clone());
                if max > 0.0 {
                    info.tag_match_score += tag.weight / max;
                }
            }
            if tag.is_core {
                info.core_tags_matched.push(tag.name.clone());
            }
        }
        info.tags = tags;

        Ok(TagBoost {
            vector: fused,
            info,
        })
    }

    /// Resolve tag names to vectors: the in-memory catalog first, then the
    /// store for tags written since the last refresh.
    async fn lookup_tags(
        &self,
        state: &TagState,
        names: &[String],
    ) -> EngineResult<Vec<(i64, String, Vec<f32>)>> {
        let mut found = Vec::new();
        let mut unresolved = Vec::new();
        for name in names {
            let resolved = state
                .by_name
                .get(&name.to_lowercase())
                .and_then(|id| Some((*id, state.names.get(id)?, state.vectors.get(id)?)));
            match resolved {
                Some((id, stored, vector)) => found.push((id, stored.clone(), vector.clone())),
                None => unresolved.push(name.clone()),
            }
        }

        if !unresolved.is_empty() {
            let dims = self.registry.dims();
            for tag in self.store.tags_by_names(&unresolved).await? {
                if let Some(vector) = tag.vector.filter(|v| v.len() == dims) {
                    found.push((tag.id, tag.name, vector));
                }
            }
        }
        Ok(found)
    }
}

fn sort_by_weight(tags: &mut [WeightedTag]) {
    tags.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
}

/// Merge near-duplicate tags. The heavier tag survives, absorbs a share of
/// the lighter one's weight and inherits its core flag.
pub fn dedup_tags(mut tags: Vec<WeightedTag>, threshold: f32) -> Vec<WeightedTag> {
    sort_by_weight(&mut tags);
    let mut kept: Vec<WeightedTag> = Vec::with_capacity(tags.len());
    for tag in tags {
        match kept
            .iter_mut()
            .find(|k| cosine_similarity(&k.vector, &tag.vector) > threshold)
        {
            Some(dominant) => {
                dominant.weight += DEDUP_ABSORB * tag.weight;
                dominant.is_core |= tag.is_core;
            }
            None => kept.push(tag),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wt(id: i64, name: &str, weight: f32, vector: &[f32], is_core: bool) -> WeightedTag {
        WeightedTag {
            id,
            name: name.to_string(),
            weight,
            level: 0,
            is_core,
            is_virtual: false,
            is_technical: is_technical(name),
            vector: vector.to_vec(),
        }
    }

    #[test]
    fn test_is_technical() {
        assert!(is_technical("tokio"));
        assert!(is_technical("k8s-ingress"));
        assert!(!is_technical("abc"));
        assert!(!is_technical("记忆"));
        assert!(!is_technical("Rust 记忆"));
        assert!(!is_technical("café au lait"));
    }

    #[test]
    fn test_dedup_merges_near_duplicates() {
        let tags = vec![
            wt(1, "rust", 0.6, &[1.0, 0.0], false),
            wt(2, "rustlang", 0.4, &[0.99, 0.1], true),
            wt(3, "cooking", 0.3, &[0.0, 1.0], false),
        ];
        let kept = dedup_tags(tags, 0.88);
        assert_eq!(kept.len(), 2);
        let rust = kept.iter().find(|t| t.id == 1).unwrap();
        assert!(rust.weight >= 0.6);
        assert!((rust.weight - 0.68).abs() < 1e-6);
        assert!(rust.is_core);
    }

    #[test]
    fn test_dedup_keeps_distinct() {
        let tags = vec![
            wt(1, "a", 0.5, &[1.0, 0.0], false),
            wt(2, "b", 0.5, &[0.0, 1.0], false),
        ];
        assert_eq!(dedup_tags(tags, 0.88).len(), 2);
    }

    #[test]
    fn test_language_penalty_by_world() {
        let config = TagsConfig::default();
        assert_eq!(language_penalty(&config, "记忆", UNKNOWN_WORLD), 1.0);
        assert_eq!(
            language_penalty(&config, "tokio", UNKNOWN_WORLD),
            config.lang_penalty_unknown
        );
        assert_eq!(language_penalty(&config, "tokio", "rust-async"), 1.0);
        assert_eq!(language_penalty(&config, "tokio", "Applied Science"), 1.0);
        assert_eq!(
            language_penalty(&config, "tokio", "家庭 生活"),
            config.lang_penalty_cross_domain
        );
        assert_eq!(
            language_penalty(&config, "tokio", "中国 History"),
            config.lang_penalty_cross_domain.sqrt()
        );
    }

    #[test]
    fn test_lerp_clamps() {
        assert_eq!(lerp([1.2, 1.4], 0.0), 1.2);
        assert!((lerp([1.2, 1.4], 0.5) - 1.3).abs() < 1e-6);
        assert_eq!(lerp([1.2, 1.4], 3.0), 1.4);
    }
}
