//! Logging setup for the controllers and the worker.
//!
//! Controllers log to stdout (the pod log is the audit trail). The worker
//! logs to stderr so that `backup-runner list` keeps stdout clean for its
//! JSON output.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging to stdout (controllers, CLI).
pub fn init_stdout(level: &str) -> Result<()> {
    init_with_writer(level, false)
}

/// Initialize logging to stderr (worker pods).
pub fn init_stderr(level: &str) -> Result<()> {
    init_with_writer(level, true)
}

fn init_with_writer(level: &str, stderr: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = fmt::layer()
        .with_ansi(false)
        .with_timer(fmt::time::ChronoUtc::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_target(false)
        .with_level(true);

    if stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.with_writer(std::io::stdout))
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    }

    Ok(())
}
