use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, fmt::time::LocalTime};

use crate::paths::BackupLayout;

const DEFAULT_FILTER: &str = "info,backup_engine=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber writing to `log_dir/log_<timestamp>`.
///
/// The returned guard flushes pending lines on drop and must be kept alive.
pub fn setup_logging(log_dir: &Path, timestamp: i64) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    let file_appender =
        tracing_appender::rolling::never(log_dir, BackupLayout::log_file_name(timestamp));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // try_init also routes `log` records through tracing.
    fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .event_format(fmt::format().pretty().with_timer(LocalTime::rfc_3339()))
        .with_writer(non_blocking)
        .try_init()
        .map_err(|e| anyhow!(e).context("Failed to set global subscriber"))?;
    Ok(guard)
}

/// Stderr-only logging for the privileged helper, whose stdout carries the protocol.
pub fn setup_stderr_logging() -> Result<()> {
    fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!(e).context("Failed to set global subscriber"))
}
