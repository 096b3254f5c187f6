//! Tracing setup: human-readable output on stderr plus a daily-rolling log
//! file under `.devloop/logs`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "devloop=debug,info" } else { "devloop=info,warn" }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
///
/// `DEVLOOP_LOG_JSON=1` switches the file output to JSON lines.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "devloop.log"));
    let json = std::env::var("DEVLOOP_LOG_JSON").is_ok_and(|v| v == "1");

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let registry = tracing_subscriber::registry().with(filter).with(stderr);
    if json {
        registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }
    Ok(guard)
}
