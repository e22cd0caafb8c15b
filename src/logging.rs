//! Tracing setup for the CLI.
//!
//! Diagnostics go to stderr in compact form, filtered by `RUST_LOG` or the
//! CLI verbosity. When a log directory is given, a daily-rotated JSON log
//! is written there as well.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Verbosity;

/// Initialize tracing. Keep the returned guard alive until exit so the
/// file writer flushes.
pub fn init(verbosity: Verbosity, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.log_filter()));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
            .ok();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("taskforge")
        .filename_suffix("jsonl")
        .build(dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(Some(guard))
}
