//! Daemon configuration (`.coven/config.yaml`, spec Section 6).
//!
//! Precedence: CLI flags > `--config` file > `{workspace}/.coven/config.yaml`
//! > defaults. Field names match the config keys named in spec Section 6.

use crate::duration::{parse_duration, DurationParseError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid duration in config: {0}")]
    Duration(#[from] DurationParseError),
}

/// Raw, serde-friendly form of the config file. Durations are strings on
/// disk (`"30m"`) and parsed into `Duration` in [`Config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawConfig {
    claim_timeout: String,
    retention_days: u32,
    soft_delete_days: u32,
    max_concurrency: usize,
    event_retention_hours: u32,
    reconciliation_interval_secs: u64,
    stale_claim_sweep_interval_secs: u64,
    heartbeat_interval_secs: u64,
    heartbeat_timeout_secs: u64,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            claim_timeout: "30m".to_string(),
            retention_days: 30,
            soft_delete_days: 7,
            max_concurrency: 4,
            event_retention_hours: 24,
            reconciliation_interval_secs: 5,
            stale_claim_sweep_interval_secs: 300,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 35,
        }
    }
}

/// Daemon-wide configuration, resolved to typed durations.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a task may stay `in_progress` with no activity before
    /// `ReleaseStaleClaims` reverts it to `open` (spec Section 4.1).
    pub claim_timeout: Duration,
    /// Soft-deleted/closed tasks older than this are hard-deleted.
    pub retention_days: u32,
    /// Closed tasks older than this are soft-deleted.
    pub soft_delete_days: u32,
    /// Maximum number of workflows in `running`/active `pending_merge` state.
    pub max_concurrency: usize,
    /// Window events are retained for replay (spec Section 3, Event).
    pub event_retention: Duration,
    /// Period of the scheduler reconciliation loop (spec Section 4.5).
    pub reconciliation_interval: Duration,
    /// Period of the stale-claim recovery sweep (spec Section 4.1).
    pub stale_claim_sweep_interval: Duration,
    /// SSE heartbeat period (spec Section 4.7).
    pub heartbeat_interval: Duration,
    /// Client-side silence before an SSE connection is considered timed out.
    pub heartbeat_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawConfig::default()).expect("default config parses")
    }
}

impl Config {
    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            claim_timeout: parse_duration(&raw.claim_timeout)?,
            retention_days: raw.retention_days,
            soft_delete_days: raw.soft_delete_days,
            max_concurrency: raw.max_concurrency.max(1),
            event_retention: Duration::from_secs(raw.event_retention_hours as u64 * 3600),
            reconciliation_interval: Duration::from_secs(raw.reconciliation_interval_secs),
            stale_claim_sweep_interval: Duration::from_secs(raw.stale_claim_sweep_interval_secs),
            heartbeat_interval: Duration::from_secs(raw.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(raw.heartbeat_timeout_secs),
        })
    }

    /// Load config from `{workspace}/.coven/config.yaml`, falling back to
    /// defaults if the file does not exist.
    pub fn load(workspace: &Path) -> Result<Self, ConfigError> {
        let path = workspace.join(".coven").join("config.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.claim_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.event_retention, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn loads_config_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "claim_timeout: \"45m\"\nmax_concurrency: 8\nretention_days: 14\n",
        )
        .unwrap();

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.claim_timeout, Duration::from_secs(45 * 60));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.retention_days, 14);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.soft_delete_days, 7);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn max_concurrency_is_clamped_to_at_least_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "max_concurrency: 0\n").unwrap();
        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.max_concurrency, 1);
    }
}
