use super::Entry;

/// Merge per-source entry lists into one feed, newest first.
///
/// Lists are concatenated in the order given and then stably sorted by
/// publication time, so equal timestamps keep source order and then
/// within-source order. Entries without a timestamp sort last. Nothing is
/// deduplicated.
pub fn merge(per_source: Vec<Vec<Entry>>) -> Vec<Entry> {
    let mut merged: Vec<Entry> = per_source.into_iter().flatten().collect();
    // Option orders None before Some, so reversing puts undated entries last
    merged.sort_by(|a, b| b.published.cmp(&a.published));
    merged
}
