//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level. Foreground processes log to
//! stderr; a detached singleton has no terminal and logs to a file instead.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialise logging to stderr
pub fn init(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {}", e)))
}

/// Initialise logging to an append-only file (ANSI colours off)
pub fn init_file(level: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {}", e)))
}
