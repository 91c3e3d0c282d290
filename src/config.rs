//! Daemon configuration (`config.yaml`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SafeShellError};
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachableBehavior {
    FailClosed,
    FailOpen,
}

impl Default for UnreachableBehavior {
    fn default() -> Self {
        Self::FailClosed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_tracing_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub unreachable_behavior: UnreachableBehavior,
    pub delegate_shell: PathBuf,
    pub log_level: LogLevel,
    pub log_file: PathBuf,
    /// Diagnostic threshold only: `regex` never backtracks exponentially,
    /// so a single evaluation can't actually run away. Exceeding this
    /// logs a warning (see `rules::engine::evaluate_with_budget`); it
    /// does not abort or truncate the evaluation in progress.
    pub condition_timeout_ms: u64,
    pub approval_timeout_seconds: f64,
    pub approval_memory_ttl_seconds: u64,
}

const MIN_CONDITION_TIMEOUT_MS: u64 = 10;
const MAX_CONDITION_TIMEOUT_MS: u64 = 5000;
const MIN_APPROVAL_TIMEOUT_S: f64 = 10.0;
const MAX_APPROVAL_TIMEOUT_S: f64 = 3600.0;
const MAX_MEMORY_TTL_S: u64 = 86400;

impl Default for Config {
    fn default() -> Self {
        Self {
            unreachable_behavior: UnreachableBehavior::default(),
            delegate_shell: detect_default_shell(),
            log_level: LogLevel::default(),
            log_file: paths::default_log_path(),
            condition_timeout_ms: 100,
            approval_timeout_seconds: 300.0,
            approval_memory_ttl_seconds: 300,
        }
    }
}

/// Reads `$SHELL`, falling back to `/bin/bash` if unset or missing on disk.
pub fn detect_default_shell() -> PathBuf {
    if let Ok(shell) = std::env::var("SHELL") {
        let path = PathBuf::from(shell);
        if path.exists() {
            return path;
        }
    }
    PathBuf::from("/bin/bash")
}

impl Config {
    /// Loads config.yaml if present, applying bounds clamping with a
    /// logged warning for out-of-range values. Missing file is not an
    /// error: defaults are returned untouched.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| SafeShellError::ConfigLoad {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;
        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|e| SafeShellError::ConfigLoad {
                path: path.to_path_buf(),
                source: Box::new(e),
            })?;
        config.clamp_and_validate();
        Ok(config)
    }

    fn clamp_and_validate(&mut self) {
        let clamped = self
            .condition_timeout_ms
            .clamp(MIN_CONDITION_TIMEOUT_MS, MAX_CONDITION_TIMEOUT_MS);
        if clamped != self.condition_timeout_ms {
            tracing::warn!(
                configured = self.condition_timeout_ms,
                clamped,
                "condition_timeout_ms out of range, clamping"
            );
            self.condition_timeout_ms = clamped;
        }

        let clamped = self
            .approval_timeout_seconds
            .clamp(MIN_APPROVAL_TIMEOUT_S, MAX_APPROVAL_TIMEOUT_S);
        if (clamped - self.approval_timeout_seconds).abs() > f64::EPSILON {
            tracing::warn!(
                configured = self.approval_timeout_seconds,
                clamped,
                "approval_timeout_seconds out of range, clamping"
            );
            self.approval_timeout_seconds = clamped;
        }

        if self.approval_memory_ttl_seconds > MAX_MEMORY_TTL_S {
            tracing::warn!(
                configured = self.approval_memory_ttl_seconds,
                clamped = MAX_MEMORY_TTL_S,
                "approval_memory_ttl_seconds out of range, clamping"
            );
            self.approval_memory_ttl_seconds = MAX_MEMORY_TTL_S;
        }

        if !self.delegate_shell.exists() {
            tracing::warn!(
                shell = %self.delegate_shell.display(),
                "configured delegate_shell not found, falling back"
            );
            self.delegate_shell = detect_default_shell();
        }
    }

    /// Writes a commented default config file. Called on first daemon
    /// start when no config.yaml exists, purely for discoverability.
    pub fn write_default(path: &Path) -> Result<()> {
        let header = "\
# SafeShell daemon configuration.
# Unrecognized keys are ignored; missing keys use the defaults below.
";
        let body = serde_yaml::to_string(&Config::default())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{header}{body}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(&tmp.path().join("config.yaml")).unwrap();
        assert_eq!(cfg.unreachable_behavior, UnreachableBehavior::FailClosed);
        assert_eq!(cfg.approval_timeout_seconds, 300.0);
    }

    #[test]
    fn out_of_range_values_are_clamped_not_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "condition_timeout_ms: 999999\napproval_timeout_seconds: 1.0\n")
            .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.condition_timeout_ms, MAX_CONDITION_TIMEOUT_MS);
        assert_eq!(cfg.approval_timeout_seconds, MIN_APPROVAL_TIMEOUT_S);
    }

    #[test]
    fn invalid_yaml_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "not: valid: yaml: [").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
