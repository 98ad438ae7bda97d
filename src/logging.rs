//! Logging setup
//!
//! Human-readable output goes to stderr; a JSON copy of every event goes to a
//! daily-rolling file under the log directory. `RUST_LOG` overrides the
//! default `info` level.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::core::GuardResult;

/// File name prefix of the rolling log files
pub const LOG_FILE_PREFIX: &str = "shadow-sandbox.log";

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process, otherwise
/// buffered file output is lost.
pub fn init_logging(log_dir: &Path) -> GuardResult<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(file_writer);

    // A second call (e.g. from tests) keeps the first subscriber
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Logging already initialised: {}", e);
    }

    tracing::debug!("Logging to {}", log_dir.display());
    Ok(guard)
}
