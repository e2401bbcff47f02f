//! Title filtering with per-source regular expressions.
//!
//! A source's patterns are compiled once into a [`PatternSet`]. An entry is
//! kept when any pattern finds a match somewhere in its title; an empty set
//! keeps everything.

use regex::Regex;
use thiserror::Error;

use super::Entry;

/// A filter pattern that failed to compile.
#[derive(Debug, Error)]
#[error("Invalid filter pattern '{pattern}': {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Compiled, ordered set of filter patterns for one source.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl PatternSet {
    /// Compile every pattern, failing on the first one that does not compile.
    ///
    /// Exact duplicates are collapsed, keeping the first occurrence.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let mut set = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if set.patterns.iter().any(|p| p == pattern) {
                continue;
            }
            let regex = Regex::new(pattern).map_err(|source| PatternError {
                pattern: pattern.to_string(),
                source,
            })?;
            set.patterns.push(pattern.to_string());
            set.compiled.push(regex);
        }
        Ok(set)
    }

    /// The source patterns, in registration order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// True when the title is admitted by this set.
    pub fn matches(&self, title: &str) -> bool {
        self.is_empty() || self.compiled.iter().any(|re| re.is_match(title))
    }

    /// Keep the entries whose titles match, preserving their order.
    pub fn apply(&self, entries: Vec<Entry>) -> Vec<Entry> {
        if self.is_empty() {
            return entries;
        }
        entries
            .into_iter()
            .filter(|entry| self.matches(&entry.title))
            .collect()
    }
}
