/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{ConfigError, LoggingConfig};

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let log_level = config.level.to_tracing_level();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "kvconnect={level},kvconnect_core_resilience={level}",
                level = log_level
            ))
        })
        .map_err(|e| ConfigError::Logging(format!("Failed to create log filter: {}", e)))?;

    // Create the subscriber based on log file configuration
    if let Some(ref log_path) = config.file {
        init_file_logging(log_path, env_filter)?;
    } else {
        init_stdout_logging(env_filter)?;
    }

    Ok(())
}

/// Initialize logging to stdout
fn init_stdout_logging(env_filter: EnvFilter) -> Result<(), ConfigError> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}

/// Initialize logging to a file
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<(), ConfigError> {
    let file = File::create(log_path)
        .map_err(|e| ConfigError::Logging(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false) // No ANSI colors in file
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_file_logging_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvconnect.log");
        let config = LoggingConfig {
            level: LogLevel::Debug,
            file: Some(path.clone()),
        };

        // Another test may already own the global subscriber
        let _ = init_logging(&config);
        assert!(path.exists());
    }
}
