//! Tracing subscriber setup.
//!
//! Console output goes to stderr, filtered by verbosity (or `RUST_LOG`).
//! When a log directory is given, every event at debug level and above is
//! also appended to `ralph.log` there, without ANSI colors.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Name of the run log inside the log directory.
pub const LOG_FILE: &str = "ralph.log";

const FILE_FILTER: &str = "ralph_loop=debug,info";

/// Default console directives for the given verbosity.
#[must_use]
pub fn console_directives(verbose: bool) -> &'static str {
    if verbose {
        "ralph_loop=debug,info"
    } else {
        "ralph_loop=info,warn"
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(verbose)));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let file = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(EnvFilter::new(FILE_FILTER)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}
