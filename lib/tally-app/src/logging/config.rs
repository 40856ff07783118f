use std::fmt;

use serde::{Deserialize, Serialize};
use tally_error::{generic_error, ErrorContext as _, GenericError};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

fn default_log_level() -> LogLevel {
    LogLevel {
        directives: DEFAULT_LOG_LEVEL.to_string(),
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    #[serde(default)]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration`.
    pub fn new(log_level: LogLevel, log_format_json: bool) -> Self {
        Self {
            log_level,
            log_format_json,
        }
    }

    /// Returns the log level.
    pub fn log_level(&self) -> &LogLevel {
        &self.log_level
    }

    /// Returns `true` if logs should be written as JSON.
    pub fn log_format_json(&self) -> bool {
        self.log_format_json
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self::new(default_log_level(), false)
    }
}

/// A validated set of log filtering directives.
///
/// This is either a bare level, such as `debug`, or any directive string understood by
/// [`EnvFilter`](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogLevel {
    directives: String,
}

impl LogLevel {
    /// Builds the filter for this log level.
    pub fn as_env_filter(&self) -> EnvFilter {
        // Directives were validated on construction.
        EnvFilter::builder().parse_lossy(&self.directives)
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        default_log_level()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.directives)
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let directives = value.trim().to_lowercase();
        if directives.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&directives)
            .error_context("Failed to parse valid log level.")?;

        Ok(Self { directives })
    }
}

impl TryFrom<&str> for LogLevel {
    type Error = GenericError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.directives
    }
}
