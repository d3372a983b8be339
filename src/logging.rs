use anyhow::{Context, Result};
use std::{fs, path::Path};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: a daily-rolling file under `log_dir`, plus
/// stderr output when `console` is set.
///
/// `level` is an `EnvFilter` directive such as `"info"` or
/// `"info,deploy=debug"`; `RUST_LOG` takes precedence when set. The returned
/// guard flushes the file writer and must outlive every log call.
pub fn setup_logging(log_dir: &Path, prefix: &str, level: &str, console: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = rolling::daily(log_dir, prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("install log subscriber")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, level={}, console={}",
        log_dir.display(),
        prefix,
        level,
        console
    );
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_log_directory() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        // A second global subscriber in the same test binary fails to install;
        // the directory is created either way.
        let _ = setup_logging(&log_dir, "modstage", "info", false);
        assert!(log_dir.is_dir());
    }
}
