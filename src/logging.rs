//! Structured logging setup.
//!
//! Stderr gets a human-readable `tracing-subscriber` fmt layer filtered by
//! the configured log level (or `RUST_LOG` if set, which always wins so
//! operators can override without editing config.yaml). The daemon also
//! appends to its log file via a non-rotating rolling writer; rotation is
//! explicitly left to the host environment.

use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Returned guard must be held for the lifetime of the process; dropping
/// it stops the background flush thread for the file appender.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(level: LogLevel, log_file: Option<&Path>) -> LoggingGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_tracing_filter()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "daemon.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LoggingGuard {
        _file_guard: file_guard,
    }
}

/// Minimal setup for short-lived clients (wrapper, hook adapter) where
/// speed matters more than diagnostics: warnings and above only, stderr.
pub fn init_minimal() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
