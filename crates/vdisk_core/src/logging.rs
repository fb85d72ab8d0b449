//! Logging setup
//!
//! The engine logs through `tracing` macros only. Binaries embedding it call
//! [`init`] once to install a stderr subscriber; libraries and tests that
//! install their own subscriber simply skip it.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{DiskError, DiskResult};

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "VDISK_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `vdisk_core=debug`.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Compact,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

fn build_filter(config: &LoggingConfig) -> DiskResult<EnvFilter> {
    let directive = std::env::var(LOG_ENV).unwrap_or_else(|_| config.level.clone());
    EnvFilter::try_new(&directive)
        .map_err(|e| DiskError::Config(format!("invalid log filter '{directive}': {e}")))
}

/// Install the global subscriber. Returns `Ok` without changes if one is
/// already installed.
pub fn init(config: &LoggingConfig) -> DiskResult<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Plain => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
    }
    Ok(())
}
