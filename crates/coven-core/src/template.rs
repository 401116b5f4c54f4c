//! Template expression engine shared by spell rendering and variable
//! resolution (spec Section 4.2, 4.3, 4.4).
//!
//! Templates are plain text interspersed with `{{ expr }}` blocks. An
//! expression is either:
//!   - a dotted path into the workflow context (`bead.id`, `{step}.outputs.k`),
//!     optionally prefixed with a leading `.` for compatibility with the
//!     `{{.previous.failed}}` style used in grimoire YAML examples;
//!   - `raw <path>` — the same lookup, but marked so the caller's escaping
//!     policy (used only for `script` commands) can skip quoting it;
//!   - `include "name" key=value ...` — renders a named partial with a
//!     context that overlays the explicit parameters on the parent context.
//!
//! Nesting depth for `include` is capped at [`MAX_INCLUDE_DEPTH`].

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAX_INCLUDE_DEPTH: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unterminated expression in template (missing `}}`)")]
    Unterminated,
    #[error("empty expression `{{{{}}}}`")]
    EmptyExpr,
    #[error("malformed include directive: {0:?}")]
    MalformedInclude(String),
    #[error("include cycle detected while including {0:?}")]
    IncludeCycle(String),
    #[error("include nesting depth exceeded {0} while including {1:?}")]
    IncludeDepthExceeded(u32, String),
    #[error("spell {0:?} not found for include")]
    IncludeNotFound(String),
}

/// A single parsed expression inside a `{{ ... }}` block.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted path lookup, e.g. `bead.id` or `previous.outputs.summary`.
    Path(String),
    /// `raw <path>` — same lookup, exempt from shell escaping.
    Raw(String),
    /// `include "name" k=v ...`.
    Include { name: String, params: BTreeMap<String, String> },
}

/// One segment of a parsed template: literal text or an expression.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Expr),
}

fn parse_segments(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    loop {
        match rest.find("{{") {
            None => {
                if !rest.is_empty() {
                    segments.push(Segment::Text(rest.to_string()));
                }
                break;
            }
            Some(start) => {
                if start > 0 {
                    segments.push(Segment::Text(rest[..start].to_string()));
                }
                let after = &rest[start + 2..];
                let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
                let raw_expr = after[..end].trim();
                if raw_expr.is_empty() {
                    return Err(TemplateError::EmptyExpr);
                }
                segments.push(Segment::Expr(parse_expr(raw_expr)?));
                rest = &after[end + 2..];
            }
        }
    }
    Ok(segments)
}

fn parse_expr(raw: &str) -> Result<Expr, TemplateError> {
    if let Some(rest) = raw.strip_prefix("include ") {
        return parse_include(rest.trim());
    }
    if let Some(rest) = raw.strip_prefix("raw ") {
        return Ok(Expr::Raw(normalize_path(rest.trim())));
    }
    Ok(Expr::Path(normalize_path(raw)))
}

fn normalize_path(path: &str) -> String {
    path.strip_prefix('.').unwrap_or(path).to_string()
}

/// Parses `"name" k1=v1 k2=v2`, where values are bare tokens or
/// double-quoted strings.
fn parse_include(rest: &str) -> Result<Expr, TemplateError> {
    let rest = rest.trim();
    if !rest.starts_with('"') {
        return Err(TemplateError::MalformedInclude(rest.to_string()));
    }
    let after_quote = &rest[1..];
    let close = after_quote
        .find('"')
        .ok_or_else(|| TemplateError::MalformedInclude(rest.to_string()))?;
    let name = after_quote[..close].to_string();
    let remainder = after_quote[close + 1..].trim();

    let mut params = BTreeMap::new();
    for token in split_params(remainder) {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| TemplateError::MalformedInclude(rest.to_string()))?;
        let value = value.trim().trim_matches('"');
        params.insert(key.trim().to_string(), value.to_string());
    }
    Ok(Expr::Include { name, params })
}

fn split_params(s: &str) -> Vec<&str> {
    s.split_whitespace().collect()
}

/// Strict parse-only validation used at grimoire-load time (spec Section
/// 4.2): confirms `{{ ... }}` blocks parse, without evaluating them.
pub fn validate_expr(template: &str) -> Result<(), TemplateError> {
    parse_segments(template).map(|_| ())
}

/// Resolves named partials for `include` directives.
pub trait IncludeResolver {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// A resolver with no includes available; useful for `when`/`command`
/// rendering, where `include` is not a meaningful directive.
pub struct NoIncludes;

impl IncludeResolver for NoIncludes {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Look up a dotted path in a JSON context object.
pub fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Stringify a context value per spec Section 4.2 serialization rules.
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Render a template against a context, resolving `include` directives via
/// `resolver`. `escape` is applied to every non-`raw` path value (identity
/// for spell bodies; shell quoting for script commands).
pub fn render(
    template: &str,
    ctx: &Value,
    resolver: &dyn IncludeResolver,
    escape: &dyn Fn(&str) -> String,
) -> Result<String, TemplateError> {
    render_depth(template, ctx, resolver, escape, 0, &mut Vec::new())
}

fn render_depth(
    template: &str,
    ctx: &Value,
    resolver: &dyn IncludeResolver,
    escape: &dyn Fn(&str) -> String,
    depth: u32,
    include_stack: &mut Vec<String>,
) -> Result<String, TemplateError> {
    let segments = parse_segments(template)?;
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(&text),
            Segment::Expr(Expr::Path(path)) => {
                out.push_str(&escape(&stringify(lookup(ctx, &path))));
            }
            Segment::Expr(Expr::Raw(path)) => {
                out.push_str(&stringify(lookup(ctx, &path)));
            }
            Segment::Expr(Expr::Include { name, params }) => {
                if depth + 1 > MAX_INCLUDE_DEPTH {
                    return Err(TemplateError::IncludeDepthExceeded(MAX_INCLUDE_DEPTH, name));
                }
                if include_stack.contains(&name) {
                    return Err(TemplateError::IncludeCycle(name));
                }
                let partial = resolver
                    .resolve(&name)
                    .ok_or_else(|| TemplateError::IncludeNotFound(name.clone()))?;

                let mut overlay = ctx.clone();
                if let Value::Object(map) = &mut overlay {
                    for (k, v) in params {
                        map.insert(k, Value::String(v));
                    }
                }

                include_stack.push(name.clone());
                let rendered =
                    render_depth(&partial, &overlay, resolver, escape, depth + 1, include_stack)?;
                include_stack.pop();
                out.push_str(&rendered);
            }
        }
    }
    Ok(out)
}

/// Render a `when` condition and require the rendered output to be the
/// literal string `true` or `false` (spec Section 4.4: no truthy string
/// coercion is permitted).
pub fn eval_strict_bool(template: &str, ctx: &Value) -> Result<bool, WhenError> {
    let rendered = render(template, ctx, &NoIncludes, &|s| s.to_string())
        .map_err(WhenError::Template)?;
    match rendered.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(WhenError::NotBoolean(other.to_string())),
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WhenError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("`when` rendered to non-boolean value {0:?}")]
    NotBoolean(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "bead": {"id": "t1", "title": "Add login"},
            "previous": {"failed": true, "success": false},
            "implement": {"outputs": {"summary": "done"}},
        })
    }

    #[test]
    fn renders_plain_path() {
        let rendered = render("hello {{ bead.id }}", &ctx(), &NoIncludes, &|s| s.to_string()).unwrap();
        assert_eq!(rendered, "hello t1");
    }

    #[test]
    fn renders_leading_dot_path() {
        let rendered = render("{{.previous.failed}}", &ctx(), &NoIncludes, &|s| s.to_string()).unwrap();
        assert_eq!(rendered, "true");
    }

    #[test]
    fn missing_path_renders_empty_string() {
        let rendered = render("[{{ nope.here }}]", &ctx(), &NoIncludes, &|s| s.to_string()).unwrap();
        assert_eq!(rendered, "[]");
    }

    #[test]
    fn escape_applied_to_plain_paths_but_not_raw() {
        let escape = |s: &str| format!("<{s}>");
        let rendered = render(
            "{{ bead.id }} {{ raw bead.id }}",
            &ctx(),
            &NoIncludes,
            &escape,
        )
        .unwrap();
        assert_eq!(rendered, "<t1> t1");
    }

    #[test]
    fn strict_bool_accepts_only_true_false() {
        assert_eq!(eval_strict_bool("{{.previous.failed}}", &ctx()), Ok(true));
        assert_eq!(
            eval_strict_bool("{{.previous.success}}", &ctx()),
            Ok(false)
        );
        assert_eq!(
            eval_strict_bool("{{ bead.id }}", &ctx()),
            Err(WhenError::NotBoolean("t1".to_string()))
        );
    }

    #[test]
    fn unterminated_expression_errors() {
        assert_eq!(
            validate_expr("hello {{ bead.id"),
            Err(TemplateError::Unterminated)
        );
    }

    #[test]
    fn include_directive_renders_with_overlay_params() {
        struct Partials;
        impl IncludeResolver for Partials {
            fn resolve(&self, name: &str) -> Option<String> {
                match name {
                    "greeting" => Some("Hi {{ name }}, task {{ bead.id }}".to_string()),
                    _ => None,
                }
            }
        }
        let rendered = render(
            "{{ include \"greeting\" name=Ada }}",
            &ctx(),
            &Partials,
            &|s| s.to_string(),
        )
        .unwrap();
        assert_eq!(rendered, "Hi Ada, task t1");
    }

    #[test]
    fn include_cycle_is_rejected() {
        struct Cyclic;
        impl IncludeResolver for Cyclic {
            fn resolve(&self, name: &str) -> Option<String> {
                match name {
                    "a" => Some("{{ include \"b\" }}".to_string()),
                    "b" => Some("{{ include \"a\" }}".to_string()),
                    _ => None,
                }
            }
        }
        let err = render("{{ include \"a\" }}", &ctx(), &Cyclic, &|s| s.to_string())
            .unwrap_err();
        assert!(matches!(err, TemplateError::IncludeCycle(_)));
    }

    #[test]
    fn include_depth_is_capped() {
        struct Deep;
        impl IncludeResolver for Deep {
            fn resolve(&self, name: &str) -> Option<String> {
                let n: u32 = name.parse().ok()?;
                Some(format!("{{{{ include \"{}\" }}}}", n + 1))
            }
        }
        let err = render("{{ include \"0\" }}", &ctx(), &Deep, &|s| s.to_string()).unwrap_err();
        assert!(matches!(err, TemplateError::IncludeDepthExceeded(5, _)));
    }

    #[test]
    fn include_missing_partial_errors() {
        let err = render("{{ include \"ghost\" }}", &ctx(), &NoIncludes, &|s| s.to_string())
            .unwrap_err();
        assert!(matches!(err, TemplateError::IncludeNotFound(name) if name == "ghost"));
    }
}
