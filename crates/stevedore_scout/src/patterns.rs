//! Ignore-pattern normalization and matching.

use crate::ScanError;
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

/// Compiled set of ignore patterns, matched against paths relative to the
/// source root.
#[derive(Clone, Default, Debug)]
pub struct IgnoreSet {
    matchers: Vec<GlobMatcher>,
}

impl IgnoreSet {
    pub fn build(patterns: &[String]) -> Result<Self, ScanError> {
        let mut matchers = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let normalized = normalize_pattern(raw);
            let matcher = GlobBuilder::new(&normalized)
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .map_err(|err| ScanError::Pattern {
                    pattern: raw.clone(),
                    message: err.to_string(),
                })?
                .compile_matcher();
            matchers.push(matcher);
        }
        Ok(Self { matchers })
    }

    pub fn matches(&self, relative: &Path) -> bool {
        self.matchers.iter().any(|m| m.is_match(relative))
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

/// Normalize a raw pattern for matching against relative paths:
/// leading separators are stripped, and a bare filename pattern gets a
/// `**/` prefix so it matches at any depth.
fn normalize_pattern(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return "**/*".to_string();
    }
    if trimmed.contains('/') {
        trimmed.to_string()
    } else {
        format!("**/{trimmed}")
    }
}
