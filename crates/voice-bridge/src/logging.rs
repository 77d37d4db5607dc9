//! Logging setup for voice bridge processes
//!
//! The `[logging]` section of the configuration file maps straight onto
//! [`LoggingConfig`]; [`setup_logging`] installs the matching global
//! `tracing` subscriber.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, VoiceBridgeError};

/// Output format of the log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human readable
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON on stdout
    Json,
}

/// Logging section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include file and line information
    pub file_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            file_info: false,
        }
    }
}

impl LoggingConfig {
    /// Parsed log level
    pub fn level(&self) -> Result<Level> {
        parse_log_level(&self.level)
    }

    /// Check the section without installing anything
    pub fn validate(&self) -> Result<()> {
        self.level().map(|_| ())
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` directives are honoured on top of the configured level. Fails if
/// a global subscriber was already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let level = config.level()?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.with_writer(std::io::stdout).json().try_init(),
    };
    installed.map_err(|e| VoiceBridgeError::config(format!("Failed to install logger: {}", e)))?;

    tracing::info!(
        format = ?config.format,
        "Starting voice-bridge v{}",
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| VoiceBridgeError::config(format!("Invalid log level: {}", level)))
}
