//! Structured logging setup.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the embedding process, which can call [`init_logging`] with the
//! `[logging]` section of its configuration.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::layer::{Layer, Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

type Filtered = Layered<EnvFilter, Registry>;

/// Install a global `tracing` subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.log_level` when set. Installing a
/// second subscriber fails with [`ProtocolError::ConfigError`].
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let mut layers: Vec<Box<dyn Layer<Filtered> + Send + Sync>> = Vec::new();

    if config.log_to_console {
        if config.json_format {
            layers.push(fmt::layer().json().boxed());
        } else {
            layers.push(fmt::layer().with_target(true).boxed());
        }
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be set to log to a file".into())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
        let writer = Mutex::new(file);
        if config.json_format {
            layers.push(fmt::layer().json().with_writer(writer).boxed());
        } else {
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Logging already initialised: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialised");
    Ok(())
}
