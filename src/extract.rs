//! Metadata extraction from document text.
//!
//! Two things are pulled out of every ingested document:
//!
//! - **Tags** from a `Tag:` line (`Tag: rust, 记忆、async | tokio`). Full-
//!   and half-width separators are accepted. Each tag is normalized, has
//!   every "super blacklist" pattern stripped out of it, and is dropped if
//!   it lands on the plain blacklist.
//! - **Entry date** from a leading `[2024-05-01]` / `2024.05.01` header,
//!   used by time-aware retrieval.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::config::TagsConfig;
use crate::embedding::prepare_text;

static TAG_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*Tag:\s*(.+)$").expect("static regex"));
static TAG_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,，、;|｜]").expect("static regex"));
static ENTRY_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(\d{4})[-.](\d{2})[-.](\d{2})\]?").expect("static regex")
});

pub struct TagExtractor {
    blacklist: HashSet<String>,
    super_patterns: Vec<Regex>,
}

impl TagExtractor {
    pub fn new(config: &TagsConfig) -> Result<Self> {
        let super_patterns = config
            .blacklist_super
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid tags.blacklist_super pattern: {}", p)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            blacklist: config.blacklist.iter().cloned().collect(),
            super_patterns,
        })
    }

    /// Tags declared in `content`, deduplicated in first-seen order.
    pub fn extract(&self, content: &str) -> Vec<String> {
        let Some(caps) = TAG_LINE_RE.captures(content) else {
            return Vec::new();
        };
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

        let mut seen = HashSet::new();
        let mut tags = Vec::new();
        for part in TAG_SPLIT_RE.split(raw) {
            let mut tag = prepare_text(part.trim().trim_end_matches(['。', '.']));
            for pattern in &self.super_patterns {
                tag = pattern.replace_all(&tag, "").trim().to_string();
            }
            if tag.is_empty() || self.blacklist.contains(&tag) {
                continue;
            }
            if seen.insert(tag.clone()) {
                tags.push(tag);
            }
        }
        tags
    }
}

/// Date header on the first non-empty line, as `YYYY-MM-DD`.
pub fn extract_entry_date(content: &str) -> Option<String> {
    let first = content.lines().map(str::trim).find(|l| !l.is_empty())?;
    let caps = ENTRY_DATE_RE.captures(first)?;
    let date = NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )?;
    Some(date.format("%Y-%m-%d").to_string())
}
