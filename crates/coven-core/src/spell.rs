//! Spell loading and rendering (spec Section 4.2).
//!
//! A spell is a named Markdown prompt template. Agent steps reference a
//! spell either inline (a multi-line string embedded directly in the
//! grimoire) or by name, resolved against user overrides first and an
//! embedded builtin set second.

use crate::template::{self, IncludeResolver, TemplateError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpellError {
    #[error("spell {0:?} not found in overrides or builtins")]
    NotFound(String),
    #[error("failed to read spell file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to render spell {name:?}: {source}")]
    Render {
        name: String,
        source: TemplateError,
    },
}

fn embedded_spell(name: &str) -> Option<&'static str> {
    match name {
        "implement" => Some(include_str!("../spells/implement.md")),
        "fix-tests" => Some(include_str!("../spells/fix-tests.md")),
        "review" => Some(include_str!("../spells/review.md")),
        _ => None,
    }
}

/// Resolves a spell reference to its raw Markdown body, per spec Section
/// 4.2's four-step resolution order. A reference containing a newline is
/// treated as an inline template rather than a name.
pub fn resolve(workspace: &Path, reference: &str) -> Result<String, SpellError> {
    if reference.contains('\n') {
        return Ok(reference.to_string());
    }

    let override_path = workspace
        .join(".coven")
        .join("spells")
        .join(format!("{reference}.md"));
    if override_path.exists() {
        return std::fs::read_to_string(&override_path).map_err(|source| SpellError::Read {
            path: override_path,
            source,
        });
    }

    if let Some(body) = embedded_spell(reference) {
        return Ok(body.to_string());
    }

    Err(SpellError::NotFound(reference.to_string()))
}

/// Resolves `include` directives against the workspace's spell overrides
/// and embedded builtins, so a spell can `include` another spell by name.
pub struct WorkspaceSpellResolver<'a> {
    pub workspace: &'a Path,
}

impl IncludeResolver for WorkspaceSpellResolver<'_> {
    fn resolve(&self, name: &str) -> Option<String> {
        resolve(self.workspace, name).ok()
    }
}

/// Render a spell body against the workflow context. Spell rendering never
/// shell-escapes values — that policy is specific to `script` commands.
pub fn render(
    workspace: &Path,
    reference: &str,
    ctx: &Value,
) -> Result<String, SpellError> {
    let body = resolve(workspace, reference)?;
    let resolver = WorkspaceSpellResolver { workspace };
    template::render(&body, ctx, &resolver, &|s| s.to_string()).map_err(|source| {
        SpellError::Render {
            name: reference.to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inline_spell_with_newline_bypasses_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let body = resolve(dir.path(), "line one\nline two").unwrap();
        assert_eq!(body, "line one\nline two");
    }

    #[test]
    fn embedded_builtin_is_found_when_no_override() {
        let dir = tempfile::tempdir().unwrap();
        let body = resolve(dir.path(), "implement").unwrap();
        assert!(body.contains("implement"));
    }

    #[test]
    fn override_spell_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let spells_dir = dir.path().join(".coven").join("spells");
        std::fs::create_dir_all(&spells_dir).unwrap();
        std::fs::write(spells_dir.join("implement.md"), "custom body").unwrap();

        let body = resolve(dir.path(), "implement").unwrap();
        assert_eq!(body, "custom body");
    }

    #[test]
    fn unknown_spell_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), "does-not-exist").unwrap_err();
        assert!(matches!(err, SpellError::NotFound(name) if name == "does-not-exist"));
    }

    #[test]
    fn render_expands_context_values() {
        let dir = tempfile::tempdir().unwrap();
        let spells_dir = dir.path().join(".coven").join("spells");
        std::fs::create_dir_all(&spells_dir).unwrap();
        std::fs::write(
            spells_dir.join("greet.md"),
            "Work on {{ bead.title }} (#{{ bead.id }})",
        )
        .unwrap();

        let ctx = json!({"bead": {"id": "t1", "title": "Add login"}});
        let rendered = render(dir.path(), "greet", &ctx).unwrap();
        assert_eq!(rendered, "Work on Add login (#t1)");
    }

    #[test]
    fn render_resolves_includes_across_spells() {
        let dir = tempfile::tempdir().unwrap();
        let spells_dir = dir.path().join(".coven").join("spells");
        std::fs::create_dir_all(&spells_dir).unwrap();
        std::fs::write(
            spells_dir.join("outer.md"),
            "Outer: {{ include \"inner\" who=world }}",
        )
        .unwrap();
        std::fs::write(spells_dir.join("inner.md"), "hello {{ who }}").unwrap();

        let rendered = render(dir.path(), "outer", &json!({})).unwrap();
        assert_eq!(rendered, "Outer: hello world");
    }
}
