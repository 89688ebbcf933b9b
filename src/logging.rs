//! Tracing subscriber setup
//!
//! The engine only emits `tracing` events; embedding applications that
//! already install a subscriber can skip this module entirely.

use crate::error::{Result, WorkspaceError};
use crate::infrastructure::config::LoggingConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

const LOG_FILE_PREFIX: &str = "workspace-sync.log";

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` overrides `config.level`. When `config.log_dir` is set, logs
/// also go to a daily rolling file; keep the returned guard alive to flush
/// it. Later calls do nothing and return `Ok(None)`.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    if INITIALIZED.load(Ordering::SeqCst) {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            WorkspaceError::Config(format!("Invalid log level {:?}: {}", config.level, e))
        })?;

    let console = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                WorkspaceError::io_error(
                    format!("Failed to create log directory: {}", e),
                    Some(dir.clone()),
                )
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();
    INITIALIZED.store(true, Ordering::SeqCst);

    if installed.is_err() {
        // someone else owns the global subscriber
        return Ok(None);
    }
    tracing::info!(level = %config.level, json = config.json, "Tracing initialized");
    Ok(guard)
}
