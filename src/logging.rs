use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{Error, Result};

/// Logs to stdout and to `<log_dir>/<start time>.log`. `RUST_LOG` takes
/// precedence over the `debug` flag. Keep the guard alive until exit so the
/// file writer is flushed.
pub fn init(debug: bool, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| Error::io(format!("create log directory {}", log_dir.display()), e))?;

    let file_name = format!("{}.log", chrono::Local::now().format("%Y-%m-%d %H-%M-%S"));
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|e| Error::Config(format!("install log subscriber: {e}")))?;

    Ok(guard)
}
