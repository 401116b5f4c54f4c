//! Grimoire matcher pipeline (spec Section 4.5).
//!
//! An ordered YAML list read from `{workspace}/.coven/grimoire-matchers.yaml`.
//! Each entry AND-combines the fields it sets; the first entry that fully
//! applies to a task wins. Hot-reloaded by the scheduler on config-file
//! change, validated before swap — callers re-[`MatcherPipeline::load`] on
//! each reconciliation tick rather than caching a watch handle, since
//! parsing a short YAML file every 5s is far cheaper than wiring a
//! filesystem watcher for this workspace's scale.

use coven_core::globmatch::{self, all_match, GlobError, TagGlob};
use coven_core::Task;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("failed to read matcher file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse grimoire-matchers.yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Glob(#[from] GlobError),
}

type Result<T> = std::result::Result<T, MatcherError>;

#[derive(Debug, Clone, Deserialize)]
struct RawMatcher {
    #[serde(default)]
    any_tags: Vec<String>,
    #[serde(default)]
    all_tags: Vec<String>,
    #[serde(default)]
    not_tags: Vec<String>,
    #[serde(default)]
    priority: Option<Vec<u8>>,
    #[serde(default)]
    priority_range: Option<[u8; 2]>,
    #[serde(default, rename = "type")]
    task_type: Option<Vec<String>>,
    #[serde(default)]
    body_contains: Vec<String>,
    #[serde(default)]
    has_parent: Option<bool>,
    #[serde(default)]
    inherit: bool,
    #[serde(default)]
    grimoire: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawPipeline {
    #[serde(default)]
    matchers: Vec<RawMatcher>,
}

/// One compiled matcher entry.
struct Matcher {
    any_tags: Vec<TagGlob>,
    all_tags: Vec<TagGlob>,
    not_tags: Vec<TagGlob>,
    priority: Option<Vec<u8>>,
    priority_range: Option<(u8, u8)>,
    task_type: Option<Vec<String>>,
    body_contains: Vec<String>,
    has_parent: Option<bool>,
    inherit: bool,
    grimoire: Option<String>,
}

impl Matcher {
    fn compile(raw: RawMatcher) -> Result<Self> {
        let compile_all = |patterns: &[String]| -> Result<Vec<TagGlob>> {
            patterns.iter().map(|p| TagGlob::compile(p).map_err(MatcherError::from)).collect()
        };
        Ok(Self {
            any_tags: compile_all(&raw.any_tags)?,
            all_tags: compile_all(&raw.all_tags)?,
            not_tags: compile_all(&raw.not_tags)?,
            priority: raw.priority,
            priority_range: raw.priority_range.map(|[lo, hi]| (lo, hi)),
            task_type: raw.task_type,
            body_contains: raw.body_contains,
            has_parent: raw.has_parent,
            inherit: raw.inherit,
            grimoire: raw.grimoire,
        })
    }

    /// AND-combine every field this matcher sets; an empty field is
    /// vacuously satisfied (spec 4.5: "each matcher AND-combines its
    /// fields").
    fn matches(&self, task: &Task) -> bool {
        if !self.any_tags.is_empty()
            && !task.tags.iter().any(|t| globmatch::any_match(&self.any_tags, t))
        {
            return false;
        }
        if !self.all_tags.is_empty() && !all_match(&self.all_tags, task.tags.iter().map(String::as_str)) {
            return false;
        }
        if !self.not_tags.is_empty() && task.tags.iter().any(|t| globmatch::any_match(&self.not_tags, t)) {
            return false;
        }
        if let Some(allowed) = &self.priority {
            if !allowed.contains(&task.priority) {
                return false;
            }
        }
        if let Some((lo, hi)) = self.priority_range {
            if task.priority < lo || task.priority > hi {
                return false;
            }
        }
        if let Some(types) = &self.task_type {
            if !types.iter().any(|t| t == &task.task_type) {
                return false;
            }
        }
        if !self.body_contains.is_empty() {
            let body_lower = task.body.to_lowercase();
            if !self.body_contains.iter().any(|needle| body_lower.contains(&needle.to_lowercase())) {
                return false;
            }
        }
        if let Some(expected) = self.has_parent {
            if task.parent_id.is_some() != expected {
                return false;
            }
        }
        true
    }
}

/// Outcome of resolving one matcher entry.
pub enum Resolution {
    Grimoire(String),
    InheritFromParent,
}

/// The ordered matcher pipeline loaded from `grimoire-matchers.yaml`.
pub struct MatcherPipeline {
    matchers: Vec<Matcher>,
}

const DEFAULT_GRIMOIRE: &str = "default";

impl MatcherPipeline {
    /// Load the pipeline, falling back to an empty pipeline (which always
    /// resolves to the `default` grimoire) when no override file exists.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = workspace.join(".coven").join("grimoire-matchers.yaml");
        if !path.exists() {
            return Ok(Self { matchers: Vec::new() });
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| MatcherError::Read {
            path: path.clone(),
            source,
        })?;
        let parsed: RawPipeline = serde_yaml::from_str(&raw)?;
        let matchers = parsed.matchers.into_iter().map(Matcher::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self { matchers })
    }

    /// Resolve the first matching entry for `task`, in order.
    pub fn resolve(&self, task: &Task) -> Option<Resolution> {
        for matcher in &self.matchers {
            if matcher.matches(task) {
                return Some(if matcher.inherit {
                    Resolution::InheritFromParent
                } else {
                    Resolution::Grimoire(matcher.grimoire.clone().unwrap_or_else(|| DEFAULT_GRIMOIRE.to_string()))
                });
            }
        }
        None
    }

    /// Fall back to `default` when nothing in the pipeline matches, or the
    /// pipeline is empty.
    pub fn resolve_or_default(&self, task: &Task) -> Resolution {
        self.resolve(task).unwrap_or_else(|| Resolution::Grimoire(DEFAULT_GRIMOIRE.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coven_core::{Id, TaskStatus};
    use std::collections::BTreeSet;

    fn task(task_type: &str, priority: u8, tags: &[&str], parent: bool) -> Task {
        let now = Utc::now();
        Task {
            id: Id::new(),
            parent_id: if parent { Some(Id::new()) } else { None },
            depth: 0,
            title: "t".into(),
            body: "fix the login bug".into(),
            task_type: task_type.into(),
            status: TaskStatus::Open,
            priority,
            tags: tags.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            grimoire_hint: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn empty_pipeline_resolves_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = MatcherPipeline::load(dir.path()).unwrap();
        let resolution = pipeline.resolve_or_default(&task("feature", 2, &[], false));
        assert!(matches!(resolution, Resolution::Grimoire(name) if name == "default"));
    }

    #[test]
    fn any_tags_selects_first_matching_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".coven")).unwrap();
        std::fs::write(
            dir.path().join(".coven").join("grimoire-matchers.yaml"),
            "matchers:\n\
             - any_tags: [\"bug*\"]\n  grimoire: quality-loop\n\
             - grimoire: default\n",
        )
        .unwrap();

        let pipeline = MatcherPipeline::load(dir.path()).unwrap();
        let bug_task = task("bug", 1, &["bugfix"], false);
        match pipeline.resolve(&bug_task) {
            Some(Resolution::Grimoire(name)) => assert_eq!(name, "quality-loop"),
            _ => panic!("expected a grimoire match"),
        }
    }

    #[test]
    fn not_tags_vetoes_an_otherwise_matching_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".coven")).unwrap();
        std::fs::write(
            dir.path().join(".coven").join("grimoire-matchers.yaml"),
            "matchers:\n\
             - any_tags: [\"*\"]\n  not_tags: [\"skip-*\"]\n  grimoire: quality-loop\n",
        )
        .unwrap();

        let pipeline = MatcherPipeline::load(dir.path()).unwrap();
        let vetoed = task("feature", 2, &["skip-review"], false);
        assert!(pipeline.resolve(&vetoed).is_none());
    }

    #[test]
    fn priority_range_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".coven")).unwrap();
        std::fs::write(
            dir.path().join(".coven").join("grimoire-matchers.yaml"),
            "matchers:\n  - priority_range: [0, 1]\n    grimoire: urgent\n",
        )
        .unwrap();
        let pipeline = MatcherPipeline::load(dir.path()).unwrap();
        assert!(pipeline.resolve(&task("feature", 1, &[], false)).is_some());
        assert!(pipeline.resolve(&task("feature", 2, &[], false)).is_none());
    }

    #[test]
    fn inherit_entry_reports_inherit_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".coven")).unwrap();
        std::fs::write(
            dir.path().join(".coven").join("grimoire-matchers.yaml"),
            "matchers:\n  - has_parent: true\n    inherit: true\n",
        )
        .unwrap();
        let pipeline = MatcherPipeline::load(dir.path()).unwrap();
        let child = task("feature", 2, &[], true);
        assert!(matches!(pipeline.resolve(&child), Some(Resolution::InheritFromParent)));
    }
}
