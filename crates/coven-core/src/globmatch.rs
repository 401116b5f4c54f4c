//! Hierarchical glob matching for the grimoire matcher pipeline.
//!
//! Patterns support `*`, `**`, `?`, `[...]`, and `{a,b}` (spec Section 4.5).
//! Built on `globset`, the same crate family this workspace's CLI tooling
//! already pulls in for path filtering; tag matching treats each pattern as
//! a standalone glob rather than a filesystem path glob.

use globset::{Glob, GlobMatcher};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlobError {
    #[error("invalid glob pattern {0:?}: {1}")]
    InvalidPattern(String, globset::Error),
}

/// A compiled glob pattern over a single string (e.g. a task tag).
#[derive(Debug, Clone)]
pub struct TagGlob {
    pattern: String,
    matcher: GlobMatcher,
}

impl TagGlob {
    pub fn compile(pattern: &str) -> Result<Self, GlobError> {
        let glob = Glob::new(pattern)
            .map_err(|e| GlobError::InvalidPattern(pattern.to_string(), e))?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.matcher.is_match(value)
    }
}

/// Returns true if `value` matches any compiled pattern.
pub fn any_match(patterns: &[TagGlob], value: &str) -> bool {
    patterns.iter().any(|p| p.is_match(value))
}

/// Returns true if every compiled pattern matches at least one value in `values`.
pub fn all_match<'a>(patterns: &[TagGlob], values: impl Iterator<Item = &'a str> + Clone) -> bool {
    patterns
        .iter()
        .all(|p| values.clone().any(|v| p.is_match(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_prefix() {
        let g = TagGlob::compile("bug-*").unwrap();
        assert!(g.is_match("bug-123"));
        assert!(!g.is_match("feature-1"));
    }

    #[test]
    fn brace_alternation_matches_either() {
        let g = TagGlob::compile("{frontend,backend}").unwrap();
        assert!(g.is_match("frontend"));
        assert!(g.is_match("backend"));
        assert!(!g.is_match("infra"));
    }

    #[test]
    fn any_match_across_patterns() {
        let patterns = vec![
            TagGlob::compile("urgent").unwrap(),
            TagGlob::compile("p0-*").unwrap(),
        ];
        assert!(any_match(&patterns, "p0-fire"));
        assert!(!any_match(&patterns, "later"));
    }

    #[test]
    fn all_match_requires_every_pattern_satisfied() {
        let patterns = vec![
            TagGlob::compile("backend").unwrap(),
            TagGlob::compile("p?").unwrap(),
        ];
        let tags = vec!["backend", "p1"];
        assert!(all_match(&patterns, tags.iter().copied()));
        let tags2 = vec!["backend"];
        assert!(!all_match(&patterns, tags2.iter().copied()));
    }
}
