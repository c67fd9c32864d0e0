//! Tracing setup for the chatlog CLI
//!
//! Usage:
//!   chatlog --debug extract ...            # Debug logging to console
//!   RUST_LOG=chatlog_core=debug chatlog    # Fine-grained log control
//!
//! `extract` also mirrors every event into `extraction.log` inside the output
//! directory unless `--no-log-file` is given.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_NAME: &str = "extraction.log";

/// Tracing configuration options
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Enable debug logging (sets the default filter to debug if RUST_LOG is unset)
    pub debug: bool,
    /// Directory that receives `extraction.log`
    pub log_dir: Option<PathBuf>,
}

fn env_filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize console logging, plus the run log file when `log_dir` is set.
///
/// Returns the path of the log file, if one was opened.
pub fn init(config: &TracingConfig) -> Result<Option<PathBuf>> {
    let file_target = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE_NAME);
            let file = File::create(&path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some((path, file))
        }
        None => None,
    };

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.debug)
        .compact();

    let (log_path, file_layer) = match file_target {
        Some((path, file)) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true);
            (Some(path), Some(layer))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(config.debug))
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(log_path)
}
