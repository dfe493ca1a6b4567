//! Diagnostic logging via `tracing-subscriber`.
//!
//! Diagnostics always go to stderr so stdout carries only the echoed child
//! output. With a log directory, a daily-rotated JSON file layer is added.
//! Verbosity follows `RUST_LOG` (default `info`).

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix for rotated diagnostic logs.
const LOG_FILE_PREFIX: &str = "runwatch.log";

/// Keeps the non-blocking file writer alive; dropping it flushes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console-only logging to stderr.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Console logging plus JSON lines in `{logs_dir}/runwatch.log.YYYY-MM-DD`.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_with_file(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Pick the logging mode from an optional `--log-dir`.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init(logs_dir: Option<&Path>) -> anyhow::Result<Option<LoggingGuard>> {
    match logs_dir {
        Some(dir) => init_with_file(dir).map(Some),
        None => {
            init_cli();
            Ok(None)
        }
    }
}
