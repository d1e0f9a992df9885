//! Text normalization and change-span diffing (component A).
//!
//! Canonicalizes note text for comparison, extracts changed-span pairs
//! between two revisions, and computes trigram Dice similarity.

use std::collections::HashMap;
use std::ops::Range;

use similar::{DiffOp, TextDiff};

const ZERO_WIDTH: [char; 4] = ['\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}'];

/// Canonicalize note text: strip zero-width characters, unify line endings,
/// lower-case, collapse per-line whitespace, drop empty lines.
pub fn normalize(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();
    let unified = stripped.replace("\r\n", "\n").replace('\r', "\n");
    let lowered = unified.to_lowercase();

    lowered
        .split('\n')
        .map(collapse_line)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text has a "sentence boundary" iff it ends with LF or, after right-trim,
/// ends with `.`, `?`, or `!`.
pub fn has_boundary(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    if text.ends_with('\n') {
        return true;
    }
    let trimmed = text.trim_end();
    trimmed.ends_with('.') || trimmed.ends_with('?') || trimmed.ends_with('!')
}

/// Character-granularity LCS diff between two already-normalized strings.
///
/// Returns `(oldSpanConcat, newSpanConcat, insertRanges)`. `replace` and
/// `delete` opcodes contribute the old substring; `replace` and `insert`
/// contribute the new substring; only `insert` ranges populate
/// `insertRanges`. Each contributed piece is trimmed before joining the
/// pieces with LF; empty pieces are dropped.
pub fn changed_spans(old: &str, new: &str) -> (String, String, Vec<Range<usize>>) {
    if old == new {
        return (String::new(), String::new(), Vec::new());
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let diff = TextDiff::from_chars(old, new);

    let mut old_parts = Vec::new();
    let mut new_parts = Vec::new();
    let mut insert_ranges = Vec::new();

    for op in diff.ops() {
        match *op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                push_trimmed(&mut old_parts, &old_chars[old_index..old_index + old_len]);
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                push_trimmed(&mut new_parts, &new_chars[new_index..new_index + new_len]);
                insert_ranges.push(new_index..new_index + new_len);
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                push_trimmed(&mut old_parts, &old_chars[old_index..old_index + old_len]);
                push_trimmed(&mut new_parts, &new_chars[new_index..new_index + new_len]);
            }
        }
    }

    (old_parts.join("\n"), new_parts.join("\n"), insert_ranges)
}

fn push_trimmed(parts: &mut Vec<String>, chars: &[char]) {
    let piece: String = chars.iter().collect();
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
}

fn trigrams(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.trim().chars().collect();
    if chars.len() < 3 {
        return Vec::new();
    }
    (0..=chars.len() - 3)
        .map(|i| chars[i..i + 3].iter().collect())
        .collect()
}

/// Dice coefficient over character-trigram multisets.
///
/// Both-empty returns `1.0`; exactly one empty returns `0.0`; otherwise
/// `2 * |A ∩ B| / (|A| + |B|)` via multiset intersection.
pub fn trigram_dice(a: &str, b: &str) -> f64 {
    let trigrams_a = trigrams(a);
    let trigrams_b = trigrams(b);

    if trigrams_a.is_empty() && trigrams_b.is_empty() {
        return 1.0;
    }
    if trigrams_a.is_empty() || trigrams_b.is_empty() {
        return 0.0;
    }

    let mut counts_a: HashMap<&str, i64> = HashMap::new();
    for t in &trigrams_a {
        *counts_a.entry(t.as_str()).or_insert(0) += 1;
    }
    let mut counts_b: HashMap<&str, i64> = HashMap::new();
    for t in &trigrams_b {
        *counts_b.entry(t.as_str()).or_insert(0) += 1;
    }

    let mut intersection = 0i64;
    for (trigram, count_a) in &counts_a {
        if let Some(count_b) = counts_b.get(trigram) {
            intersection += (*count_a).min(*count_b);
        }
    }

    2.0 * intersection as f64 / (trigrams_a.len() + trigrams_b.len()) as f64
}
