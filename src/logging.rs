//! Tracing subscriber setup.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_PREFIX: &str = "stageforge.log";

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("stageforge=debug")
        } else {
            EnvFilter::new("stageforge=info")
        }
    })
}

/// Install the global subscriber: compact stderr output, plus a daily
/// rolling file under `log_dir` when one is given.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
pub fn init_logging(verbose: bool, json: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);

    let (file_writer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let (plain_file, json_file) = match file_writer {
        Some(writer) if json => (
            None,
            Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
        ),
        Some(writer) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            None,
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(stderr_layer)
        .with(plain_file)
        .with(json_file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
