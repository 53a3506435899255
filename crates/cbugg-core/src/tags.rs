//! Tag list parsing.
//!
//! Tags arrive as a single free-form string where commas and whitespace both
//! separate entries. They are stored as a sorted set so reads are
//! deterministic regardless of input order.

use std::collections::BTreeSet;

/// Parse a comma- or whitespace-separated tag list into a deduplicated set.
pub fn parse_tags(input: &str) -> BTreeSet<String> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical text form of a tag set, used for history and no-op detection.
pub fn join_tags(tags: &BTreeSet<String>) -> String {
    tags.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Tags present in `new` but not in `old`.
pub fn added_tags(old: &BTreeSet<String>, new: &BTreeSet<String>) -> Vec<String> {
    new.difference(old).cloned().collect()
}
