//! Logging setup
//!
//! Everything is mirrored to stdout and to a daily log file.

use anyhow::Result;
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, fmt::time::ChronoLocal, prelude::*, EnvFilter};

/// Name of the log file for a given day
pub fn log_file_name(now: DateTime<Local>) -> String {
    format!("{}.log", now.format("%Y%m%d"))
}

/// Setup console and file logging at the specified level
///
/// Returns the path of the log file being appended to.
pub fn setup_logging(level: &str, log_dir: &str) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let path = Path::new(log_dir).join(log_file_name(Local::now()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .ok();

    Ok(path)
}
