//! Structured logging setup.
//!
//! Logs go to stdout and, when `log.file_path` is configured, to a daily
//! rolling file through a non-blocking writer. The returned guard must be
//! held for the life of the process or buffered lines are lost.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;

const DEFAULT_LOG_FILE: &str = "venue_router.log";

/// Initialise the global `tracing` subscriber.
pub fn init_logging(cfg: &LogConfig, mode: &str) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(mode)));

    let json_logging = std::env::var("VENUE_ROUTER_LOG_JSON").is_ok();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if cfg.stdout {
        if json_logging {
            layers.push(fmt::layer().json().with_target(true).with_thread_ids(true).boxed());
        } else {
            layers.push(fmt::layer().with_target(true).boxed());
        }
    }

    let mut guard = None;
    if let Some(path) = cfg.file_path.as_deref().filter(|p| !p.trim().is_empty()) {
        let (dir, prefix) = split_log_path(path);
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .max_log_files(retained_files(cfg.max_age_days))
            .build(&dir)
            .with_context(|| format!("Failed to open log file {path}"))?;
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if cfg.file_path.is_some() {
        // Rotation is daily; size is advisory only.
        tracing::debug!(max_size_mb = cfg.max_size_mb, max_age_days = cfg.max_age_days, "File logging enabled");
    }

    Ok(guard)
}

fn default_directive(mode: &str) -> &'static str {
    if mode.eq_ignore_ascii_case("debug") {
        "venue_router=debug"
    } else {
        "venue_router=info"
    }
}

/// One rotated file per day of retention.
fn retained_files(max_age_days: u64) -> usize {
    max_age_days.max(1) as usize
}

fn split_log_path(path: &str) -> (PathBuf, String) {
    let p = Path::new(path);
    let dir = p
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let prefix = p
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, prefix)
}
