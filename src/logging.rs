use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log file prefix; the appender adds the date suffix.
const LOG_PREFIX: &str = "flashdeck.log";

/// Setup logging to stderr and a daily rotating file in `log_dir`.
///
/// `RUST_LOG` overrides the level chosen by `debug_mode`.
///
/// # Returns
/// A guard that must be held for the duration of the program to keep the
/// file writer flushing
pub fn setup_logging(
    log_dir: &Path,
    debug_mode: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    ensure_log_dir(log_dir)?;

    let file_appender = rolling::daily(log_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if debug_mode { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        "Logging initialized: dir={}, debug={}",
        log_dir.display(),
        debug_mode
    );

    Ok(guard)
}

fn ensure_log_dir(log_dir: &Path) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_directory_created() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path().join("logs").join("nested");

        // Only the directory handling; installing the global subscriber here
        // would conflict with other tests in the same process.
        ensure_log_dir(&log_dir).unwrap();
        assert!(log_dir.is_dir());

        // Idempotent
        ensure_log_dir(&log_dir).unwrap();
    }
}
