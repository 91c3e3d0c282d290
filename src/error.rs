//! Crate-wide error type.
//!
//! Mirrors the abstract error kinds of the design: config/rule/override
//! loading is fatal at startup and names the offending file; everything
//! that happens once the daemon is serving connections is local to a
//! connection, a rule, or a condition and never propagates past it.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SafeShellError {
    #[error("failed to load config {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to load rule file {path}: {reason}")]
    RuleLoad { path: PathBuf, reason: String },

    #[error("override references unknown rule {rule_name:?} in {path}")]
    OverrideLoad { path: PathBuf, rule_name: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("daemon failed to start: {0}")]
    DaemonStart(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, SafeShellError>;
