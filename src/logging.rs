use std::fs;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Overrides the configured level when set, e.g. `orgmigrate=debug`.
pub const LOG_ENV: &str = "ORGMIGRATE_LOG";

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(format!("{},reqwest=warn,hyper=warn", config.level)),
    }
}

/// Installs the global subscriber. Log records from `log`-based crates are
/// bridged in by the subscriber itself. With a log file configured, output
/// goes there through a non-blocking writer; keep the returned guard alive
/// until exit.
///
/// A subscriber installed earlier (tests, embedding) wins and `Ok(None)` is
/// returned.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    if tracing::dispatcher::has_been_set() {
        tracing::debug!(target: "orgmigrate", event = "logging_already_initialized");
        return Ok(None);
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("log file path {} has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (tracing_subscriber::fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None => (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
            None,
        ),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer);
    match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.with_ansi(config.file.is_none()).try_init(),
    }
    .map_err(|err| anyhow::anyhow!(err))
    .context("install log subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_sink_creates_its_directory_and_later_inits_are_no_ops() {
        let dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            file: Some(dir.path().join("logs").join("run.log")),
            ..LoggingConfig::default()
        };
        let guard = init(&config).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());

        // The first subscriber stays installed.
        assert!(init(&LoggingConfig::default()).unwrap().is_none());
    }
}
