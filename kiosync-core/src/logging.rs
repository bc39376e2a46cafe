//! Logging infrastructure for kiosync
//!
//! Logs go to `~/.local/state/kiosync/kiosync.log.<date>`, rotated daily.
//! `RUST_LOG` overrides the configured filter entirely.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Dependencies that log per request at debug level
const QUIET_DEPENDENCIES: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "rusqlite"];

/// Filter directives for a logging config.
///
/// The queue processor and triggers can run at their own level, so a kiosk
/// can trace delivery without turning on debug output everywhere else.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = vec![config.level.clone()];
    if let Some(sync_level) = &config.sync_level {
        directives.push(format!("kiosync_core::sync={}", sync_level));
    }
    for dep in QUIET_DEPENDENCIES {
        directives.push(format!("{}=warn", dep));
    }
    directives.join(",")
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = filter_directives(config);
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", directives, e)))
}

/// Install the file subscriber. Keep the guard alive for the whole process.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("kiosync.log")
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(build_filter(config)?)
        .with(file_layer)
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        sync_level = config.sync_level.as_deref().unwrap_or("-"),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let filter = build_filter(&LoggingConfig::default())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Flushes buffered log lines when dropped
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        assert!(log_file_path().ends_with("kiosync.log"));
    }

    #[test]
    fn test_default_directives_quiet_dependencies() {
        let directives = filter_directives(&LoggingConfig::default());
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(!directives.contains("kiosync_core::sync"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_sync_level_override() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            sync_level: Some("debug".to_string()),
            ..Default::default()
        };
        let directives = filter_directives(&config);
        assert!(directives.starts_with("warn,kiosync_core::sync=debug,"));
    }
}
