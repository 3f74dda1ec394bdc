//! Paragraph-boundary text chunker.
//!
//! Splits document text into pieces that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! so each chunk stays semantically coherent; a single oversized paragraph
//! is hard-split on the last newline or space before the limit.
//!
//! Token counts are estimated: CJK characters count as roughly one token
//! each, everything else as a quarter token.

/// Approximate chars-per-token ratio for non-CJK text.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Blank input yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_weight = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let para_weight = weight(trimmed);

        // If adding this paragraph would exceed max, flush current buffer
        if !current_buf.is_empty() && weight(&current_buf) + 2 + para_weight > max_weight {
            chunks.push(std::mem::take(&mut current_buf));
        }

        if para_weight > max_weight {
            if !current_buf.is_empty() {
                chunks.push(std::mem::take(&mut current_buf));
            }
            hard_split(trimmed, max_weight, &mut chunks);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(current_buf);
    }

    chunks
}

/// Length in quarter-tokens: 4 per CJK character, 1 per other character.
fn weight(text: &str) -> usize {
    text.chars()
        .map(|c| if is_cjk(c) { CHARS_PER_TOKEN } else { 1 })
        .sum()
}

pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF)
}

fn hard_split(paragraph: &str, max_weight: usize, chunks: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        // Largest char boundary that fits the budget
        let mut acc = 0;
        let mut split_at = remaining.len();
        for (pos, c) in remaining.char_indices() {
            acc += if is_cjk(c) { CHARS_PER_TOKEN } else { 1 };
            if acc > max_weight {
                split_at = pos;
                break;
            }
        }
        if split_at == 0 {
            // A single character over budget still has to go somewhere
            split_at = remaining.chars().next().map(char::len_utf8).unwrap_or(remaining.len());
        }

        // Try to split at a newline or space boundary
        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .filter(|&pos| pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };

        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        remaining = &remaining[actual_split..];
    }
}
