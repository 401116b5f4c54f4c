//! Duration string parsing for grimoire `timeout` fields.
//!
//! Accepts a small, explicit grammar: an integer followed by one of
//! `s` (seconds), `m` (minutes), or `h` (hours). This mirrors the duration
//! strings used throughout `config.yaml` and grimoire YAML (spec Section 3).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,
    #[error("invalid duration unit in {0:?} (expected s, m, or h)")]
    InvalidUnit(String),
    #[error("invalid duration value in {0:?}")]
    InvalidValue(String),
}

/// Parse a duration string like `"5m"`, `"15m"`, or `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationParseError::Empty);
    }
    let (value_part, unit) = s.split_at(s.len() - 1);
    let multiplier = match unit {
        "s" => 1u64,
        "m" => 60,
        "h" => 3600,
        _ => return Err(DurationParseError::InvalidUnit(s.to_string())),
    };
    let value: u64 = value_part
        .parse()
        .map_err(|_| DurationParseError::InvalidValue(s.to_string()))?;
    Ok(Duration::from_secs(value * multiplier))
}

/// Default timeout for a `script` step (spec Section 3).
pub fn default_script_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Default timeout for an `agent` step (spec Section 3).
pub fn default_agent_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Default timeout for an entire workflow (spec Section 5).
pub fn default_workflow_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_minutes_hours() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_empty_and_bad_unit() {
        assert_eq!(parse_duration(""), Err(DurationParseError::Empty));
        assert!(matches!(
            parse_duration("5x"),
            Err(DurationParseError::InvalidUnit(_))
        ));
        assert!(matches!(
            parse_duration("xm"),
            Err(DurationParseError::InvalidValue(_))
        ));
    }
}
