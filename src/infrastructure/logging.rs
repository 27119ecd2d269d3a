//! Logging system configuration and initialization
//!
//! Console output by default, optional daily-rotated file output. The
//! non-blocking writer guard must outlive the process, so it is parked in a
//! module-level static.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::infrastructure::config::LoggingConfig;

lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Log directory for file output when none is configured.
pub fn default_log_directory() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs")
}

/// Initialize the tracing subscriber from the logging configuration.
///
/// `RUST_LOG` takes precedence over the configured level so a one-off debug
/// run never needs a config edit.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level: {}", config.level))?;

    let console_layer = config.console_output.then(fmt::layer);

    let file_layer = if config.file_output {
        let log_dir = config.log_dir.clone().unwrap_or_else(default_log_directory);
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let appender = rolling::daily(&log_dir, "bookdelta.log");
        let (writer, guard) = non_blocking(appender);
        if let Ok(mut guards) = LOG_GUARDS.lock() {
            guards.push(guard);
        }
        Some(fmt::layer().with_writer(writer).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}
