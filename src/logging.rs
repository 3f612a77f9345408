//! Diagnostic logging.
//!
//! Diagnostics go through [tracing] to stderr, or to a file when one is configured. Stdout is
//! reserved for the run report.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// The name of the log file written inside a log directory.
pub const LOG_FILE: &str = "stockpiler.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("could not open log file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("could not install the logger: {0}")]
    Install(String),
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `log_level` when it is set. With a `log_dir`, entries are appended to
/// [LOG_FILE] inside it instead of going to stderr.
///
/// # Errors
///
/// Returns an error if the log file can't be opened or a subscriber is already installed.
pub fn init(log_level: &str, log_dir: Option<&Path>) -> Result<(), LoggingError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(log_level))
        .with_target(false);

    let installed = match log_dir {
        Some(dir) => {
            let file = open_log_file(dir)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };
    installed.map_err(|e| LoggingError::Install(e.to_string()))
}

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Opens `<dir>/stockpiler.log` for appending, creating the directory if needed.
fn open_log_file(dir: &Path) -> Result<File, LoggingError> {
    let path = dir.join(LOG_FILE);
    fs::create_dir_all(dir)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(&path))
        .map_err(|source| LoggingError::Open { path, source })
}
