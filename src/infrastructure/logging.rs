use std::{fs, io};

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Keeps the non-blocking file writer flushing. Hold this in `main` for the
/// process lifetime; dropping it loses buffered log lines.
pub struct LogGuard {
    _file: tracing_appender::non_blocking::WorkerGuard,
}

/// Console and daily-rolling-file subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fs::create_dir_all(&config.logs_dir)
        .with_context(|| format!("failed to create log directory {}", config.logs_dir))?;
    let file_appender = tracing_appender::rolling::daily(&config.logs_dir, "pagefeed.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(io::stdout).with_target(true))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_ansi(false),
        )
        .try_init()
        .context("tracing subscriber already installed")?;

    tracing::info!(logs = %config.logs_dir, "tracing initialized");
    Ok(LogGuard { _file: guard })
}
