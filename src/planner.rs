//! Dynamic retrieval parameters.
//!
//! From the query signals (logic depth `L`, resonance `R`) and the semantic
//! width `S` of the conversation context, the planner derives:
//!
//! - `β = sigmoid(L·ln(1+R) − S·noise_penalty)`, mapped into the tag-weight
//!   range;
//! - `K = clamp(k_base + round(3L + 2·ln(1+R)), 3, 10)`;
//! - a tag truncation ratio that rises with `L` and `R` and falls with `S`.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

use crate::config::PlannerConfig;
use crate::signals::SignalAnalysis;

pub const MIN_K: usize = 3;
pub const MAX_K: usize = 10;
/// Tag lists at or below this length are never truncated.
pub const TRUNCATION_FLOOR: usize = 5;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z0-9]+|[^\s\x00-\xff]").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueryPlan {
    pub k: usize,
    pub tag_weight: f32,
    pub truncation_ratio: f32,
    pub beta: f32,
    pub logic_depth: f32,
    pub resonance: f32,
    pub semantic_width: f32,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Starting K from input size: longer queries and richer context ask for
/// more results.
pub fn k_base(query_text: &str, context_text: Option<&str>) -> usize {
    let len = query_text.chars().count();
    let mut k = if len > 100 {
        6
    } else if len > 30 {
        4
    } else {
        3
    };

    if let Some(context) = context_text {
        let unique: HashSet<&str> = TOKEN_RE.find_iter(context).map(|m| m.as_str()).collect();
        if unique.len() > 100 {
            k = k.max(6);
        } else if unique.len() > 40 {
            k = k.max(4);
        }
    }
    k
}

/// Keep the head of a ranked tag list. Lists of five or fewer are returned
/// whole; longer ones keep `max(5, ceil(len·ratio))`.
pub fn truncate_tags<T: Clone>(tags: &[T], ratio: f32) -> Vec<T> {
    if tags.len() <= TRUNCATION_FLOOR {
        return tags.to_vec();
    }
    let keep = ((tags.len() as f32 * ratio).ceil() as usize)
        .max(TRUNCATION_FLOOR)
        .min(tags.len());
    tags[..keep].to_vec()
}

#[derive(Debug, Clone)]
pub struct QueryPlanner {
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn plan(
        &self,
        signals: &SignalAnalysis,
        semantic_width: f32,
        query_text: &str,
        context_text: Option<&str>,
    ) -> QueryPlan {
        let l = signals.logic_depth;
        let r = signals.resonance;
        let s = semantic_width;

        let beta = sigmoid(l * (1.0 + r).ln() - s * self.config.noise_penalty);
        let [lo, hi] = self.config.tag_weight_range;
        let tag_weight = lo + beta * (hi - lo);

        let adjustment = (3.0 * l + 2.0 * (1.0 + r).ln()).round() as i64;
        let k = (k_base(query_text, context_text) as i64 + adjustment)
            .clamp(MIN_K as i64, MAX_K as i64) as usize;

        let [t_lo, t_hi] = self.config.truncation_range;
        let truncation_ratio =
            (self.config.truncation_base + 0.3 * l - 0.2 * s + 0.1 * r.min(1.0)).clamp(t_lo, t_hi);

        debug!(l, r, s, beta, tag_weight, k, truncation_ratio, "Planned query");
        QueryPlan {
            k,
            tag_weight,
            truncation_ratio,
            beta,
            logic_depth: l,
            resonance: r,
            semantic_width: s,
        }
    }
}
