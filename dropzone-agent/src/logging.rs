use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "dropzone.log";

fn filter(debug: bool) -> EnvFilter {
    let default_directive = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Console-only subscriber for use before the configuration is known.
/// Scope it with `tracing::subscriber::with_default`.
pub fn bootstrap() -> impl Subscriber + Send + Sync {
    fmt()
        .with_env_filter(filter(false))
        .with_target(false)
        .finish()
}

/// Install the global subscriber. `RUST_LOG` wins over the `debug` flag.
///
/// With a log directory, events are also written to a daily-rolling file; the
/// returned guard must be held until exit so buffered lines are flushed.
pub fn init(debug: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let registry = tracing_subscriber::registry()
        .with(filter(debug))
        .with(fmt::layer().with_target(false));

    let Some(dir) = log_dir else {
        registry.try_init().context("failed to initialise logging")?;
        return Ok(None);
    };

    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
    registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("failed to initialise logging")?;
    Ok(Some(guard))
}
