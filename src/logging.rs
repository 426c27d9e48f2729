//! Tracing subscriber setup.
//!
//! Human-readable output goes to stderr (stdout belongs to command output).
//! When a log directory is given, a JSON layer is added that writes to a
//! daily-rolling `foreman.log` through a non-blocking appender; the returned
//! guard must be held until exit so buffered lines are flushed.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log file prefix under `.foreman/logs/`.
pub const LOG_FILE_NAME: &str = "foreman.log";

/// Pick the filter directive: `--verbose` wins, then `FOREMAN_LOG`, then
/// `RUST_LOG`, then `info`.
pub fn build_filter_directive(
    foreman_log: Option<&str>,
    rust_log: Option<&str>,
    verbose: bool,
) -> String {
    if verbose {
        return "debug".to_string();
    }
    [foreman_log, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or("info")
        .to_string()
}

/// Install the global subscriber. Returns the file writer guard, if any.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let directive = build_filter_directive(
        std::env::var("FOREMAN_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        verbose,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    match log_dir {
        Some(dir) if dir.is_dir() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()?;
            Ok(Some(guard))
        }
        _ => {
            registry.try_init()?;
            Ok(None)
        }
    }
}
