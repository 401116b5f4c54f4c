//! Grimoire loading and validation (spec Section 4.2).
//!
//! A grimoire is a named, ordered sequence of steps read from
//! `{workspace}/.coven/grimoires/{name}.yaml`, falling back to an embedded
//! builtin set. Validation runs eagerly at load time so malformed YAML
//! never reaches the engine mid-workflow.

use crate::duration::parse_duration;
use crate::template::{validate_expr, TemplateError};
use crate::types::{Grimoire, StepDef, StepType};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GrimoireError {
    #[error("grimoire {0:?} not found")]
    NotFound(String),
    #[error("failed to read grimoire file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse grimoire YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate step name {0:?} within the same step list")]
    DuplicateStepName(String),
    #[error("step {step:?} is type {step_type:?} but is missing required field {field:?}")]
    MissingField {
        step: String,
        step_type: StepType,
        field: &'static str,
    },
    #[error("step {step:?} has max_iterations={value}, must be >= 1")]
    InvalidMaxIterations { step: String, value: i64 },
    #[error("step {step:?} has an unparseable timeout {timeout:?}: {source}")]
    InvalidTimeout {
        step: String,
        timeout: String,
        source: crate::duration::DurationParseError,
    },
    #[error("step {step:?} field {field:?} has an invalid template expression: {source}")]
    InvalidTemplate {
        step: String,
        field: &'static str,
        source: TemplateError,
    },
}

type Result<T> = std::result::Result<T, GrimoireError>;

/// Embedded builtin grimoires, bundled at compile time so the daemon works
/// in a fresh workspace with no `.coven/grimoires/` overrides yet.
fn embedded_grimoire(name: &str) -> Option<&'static str> {
    match name {
        "default" => Some(include_str!("../grimoires/default.yaml")),
        "quality-loop" => Some(include_str!("../grimoires/quality-loop.yaml")),
        _ => None,
    }
}

/// Load a grimoire by name, preferring a user override in
/// `{workspace}/.coven/grimoires/{name}.yaml` over the embedded builtin.
pub fn load(workspace: &Path, name: &str) -> Result<Grimoire> {
    let override_path = workspace
        .join(".coven")
        .join("grimoires")
        .join(format!("{name}.yaml"));

    let raw = if override_path.exists() {
        std::fs::read_to_string(&override_path).map_err(|source| GrimoireError::Read {
            path: override_path,
            source,
        })?
    } else if let Some(embedded) = embedded_grimoire(name) {
        embedded.to_string()
    } else {
        return Err(GrimoireError::NotFound(name.to_string()));
    };

    parse(&raw, name)
}

/// Parse and validate grimoire YAML (exposed for tests and the override
/// hot-reload path in the scheduler).
pub fn parse(raw: &str, name: &str) -> Result<Grimoire> {
    #[derive(serde::Deserialize)]
    struct RawGrimoire {
        #[serde(default)]
        name: Option<String>,
        steps: Vec<StepDef>,
    }

    let parsed: RawGrimoire = serde_yaml::from_str(raw)?;
    let grimoire = Grimoire {
        name: parsed.name.unwrap_or_else(|| name.to_string()),
        steps: parsed.steps,
    };
    validate_steps(&grimoire.steps, &mut HashSet::new())?;
    Ok(grimoire)
}

fn validate_steps(steps: &[StepDef], seen_names: &mut HashSet<String>) -> Result<()> {
    for step in steps {
        if !seen_names.insert(step.name.clone()) {
            return Err(GrimoireError::DuplicateStepName(step.name.clone()));
        }
        validate_step(step)?;
    }
    Ok(())
}

fn validate_step(step: &StepDef) -> Result<()> {
    if let Some(timeout) = &step.timeout {
        parse_duration(timeout).map_err(|source| GrimoireError::InvalidTimeout {
            step: step.name.clone(),
            timeout: timeout.clone(),
            source,
        })?;
    }
    if let Some(when) = &step.when {
        validate_expr(when).map_err(|source| GrimoireError::InvalidTemplate {
            step: step.name.clone(),
            field: "when",
            source,
        })?;
    }

    match step.step_type {
        StepType::Agent => {
            if step.spell.is_none() {
                return Err(GrimoireError::MissingField {
                    step: step.name.clone(),
                    step_type: step.step_type,
                    field: "spell",
                });
            }
            if let Some(input) = &step.input {
                validate_expr(input).map_err(|source| GrimoireError::InvalidTemplate {
                    step: step.name.clone(),
                    field: "input",
                    source,
                })?;
            }
        }
        StepType::Script => {
            let Some(command) = &step.command else {
                return Err(GrimoireError::MissingField {
                    step: step.name.clone(),
                    step_type: step.step_type,
                    field: "command",
                });
            };
            validate_expr(command).map_err(|source| GrimoireError::InvalidTemplate {
                step: step.name.clone(),
                field: "command",
                source,
            })?;
        }
        StepType::Loop => {
            let Some(inner) = &step.steps else {
                return Err(GrimoireError::MissingField {
                    step: step.name.clone(),
                    step_type: step.step_type,
                    field: "steps",
                });
            };
            if let Some(max_iterations) = step.max_iterations {
                if max_iterations < 1 {
                    return Err(GrimoireError::InvalidMaxIterations {
                        step: step.name.clone(),
                        value: max_iterations as i64,
                    });
                }
            }
            validate_steps(inner, &mut HashSet::new())?;
        }
        StepType::Merge => {}
    }
    Ok(())
}

/// Resolve the effective timeout for a step, applying spec Section 3 defaults.
pub fn step_timeout(step: &StepDef) -> std::time::Duration {
    if let Some(raw) = &step.timeout {
        // Already validated at load time.
        return parse_duration(raw).unwrap_or_else(|_| crate::duration::default_agent_timeout());
    }
    match step.step_type {
        StepType::Script => crate::duration::default_script_timeout(),
        StepType::Agent => crate::duration::default_agent_timeout(),
        StepType::Loop | StepType::Merge => crate::duration::default_agent_timeout(),
    }
}

/// Resolve `max_iterations` with the spec Section 3 default of 100.
pub fn max_iterations(step: &StepDef) -> u32 {
    step.max_iterations.unwrap_or(100)
}

/// Resolve `require_review` with the spec Section 3 default of `true`.
pub fn require_review(step: &StepDef) -> bool {
    step.require_review.unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_embedded_default_grimoire() {
        let dir = tempfile::tempdir().unwrap();
        let grimoire = load(dir.path(), "default").unwrap();
        assert!(!grimoire.steps.is_empty());
    }

    #[test]
    fn override_grimoire_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let grimoires_dir = dir.path().join(".coven").join("grimoires");
        std::fs::create_dir_all(&grimoires_dir).unwrap();
        std::fs::write(
            grimoires_dir.join("default.yaml"),
            "name: default\nsteps:\n  - name: only-step\n    type: script\n    command: \"echo hi\"\n",
        )
        .unwrap();

        let grimoire = load(dir.path(), "default").unwrap();
        assert_eq!(grimoire.steps.len(), 1);
        assert_eq!(grimoire.steps[0].name, "only-step");
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let yaml = "steps:\n\
            - name: dup\n  type: script\n  command: echo\n\
            - name: dup\n  type: script\n  command: echo\n";
        let err = parse(yaml, "bad").unwrap_err();
        assert!(matches!(err, GrimoireError::DuplicateStepName(name) if name == "dup"));
    }

    #[test]
    fn rejects_agent_step_without_spell() {
        let yaml = "steps:\n  - name: implement\n    type: agent\n";
        let err = parse(yaml, "bad").unwrap_err();
        assert!(matches!(err, GrimoireError::MissingField { field: "spell", .. }));
    }

    #[test]
    fn rejects_invalid_max_iterations() {
        let yaml = "steps:\n\
            - name: quality\n  type: loop\n  max_iterations: 0\n  steps:\n    - name: inner\n      type: script\n      command: echo\n";
        let err = parse(yaml, "bad").unwrap_err();
        assert!(matches!(err, GrimoireError::InvalidMaxIterations { value: 0, .. }));
    }

    #[test]
    fn rejects_unparseable_timeout() {
        let yaml = "steps:\n  - name: s\n    type: script\n    command: echo\n    timeout: \"soon\"\n";
        let err = parse(yaml, "bad").unwrap_err();
        assert!(matches!(err, GrimoireError::InvalidTimeout { .. }));
    }

    #[test]
    fn defaults_applied_when_absent() {
        let yaml = "steps:\n  - name: s\n    type: script\n    command: echo\n";
        let grimoire = parse(yaml, "g").unwrap();
        let step = &grimoire.steps[0];
        assert_eq!(step_timeout(step), crate::duration::default_script_timeout());
    }

    #[test]
    fn max_iterations_defaults_to_100() {
        let step = StepDef {
            name: "loop".into(),
            step_type: StepType::Loop,
            timeout: None,
            when: None,
            output: None,
            spell: None,
            input: None,
            command: None,
            on_fail: None,
            on_success: None,
            steps: Some(vec![]),
            max_iterations: None,
            on_max_iterations: None,
            require_review: None,
        };
        assert_eq!(max_iterations(&step), 100);
    }
}
