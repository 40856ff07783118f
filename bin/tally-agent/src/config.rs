use std::{path::PathBuf, time::Duration};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tally_app::logging::{LogLevel, LoggingConfiguration};
use tally_components::transports::ApiMode;
use tally_config::{ConfigurationError, ConfigurationLoader};
use tally_core::pipeline::PipelineConfiguration;

// Environment variables understood without the `TALLY_` prefix, and the settings they map onto.
const ENVIRONMENT_ALIASES: &[(&str, &str)] = &[
    ("ADDRESS", "server_address"),
    ("POLL_INTERVAL", "poll_interval"),
    ("REPORT_INTERVAL", "report_interval"),
    ("NUM_WORKERS", "num_workers"),
    ("LOG_LEVEL", "log_level"),
];

// Aliases whose value must be a whole number. An unparseable value is ignored, leaving the flag or file value in place.
const NUMERIC_ALIASES: &[&str] = &["POLL_INTERVAL", "REPORT_INTERVAL", "NUM_WORKERS"];

fn environment_aliases() -> Vec<(&'static str, &'static str)> {
    ENVIRONMENT_ALIASES
        .iter()
        .copied()
        .filter(|(var, _)| {
            !NUMERIC_ALIASES.contains(var)
                || std::env::var(var).map_or(true, |value| value.trim().parse::<u64>().is_ok())
        })
        .collect()
}

/// Command-line flags.
///
/// Every flag is optional. Flags override the configuration file, and are themselves overridden by environment
/// variables.
#[derive(Clone, Parser, Serialize)]
#[command(about)]
pub struct Cli {
    /// Path to a YAML configuration file.
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Address of the collector, either `host:port` or a URL.
    #[arg(short = 'a', long = "address")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,

    /// How often to sample metrics, in seconds.
    #[arg(short = 'p', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,

    /// How often to send sampled metrics to the collector, in seconds.
    #[arg(short = 'r', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<u64>,

    /// Number of concurrent delivery workers.
    #[arg(long = "workers")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,

    /// Log level, or any `RUST_LOG`-style filter directives.
    #[arg(short = 'l', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

const fn default_poll_interval() -> u64 {
    2
}

const fn default_report_interval() -> u64 {
    10
}

const fn default_num_workers() -> usize {
    4
}

const fn default_request_timeout() -> u64 {
    10
}

const fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_server_address() -> String {
    "localhost:8080".to_string()
}

/// Agent configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfiguration {
    /// Address of the collector.
    #[serde(default = "default_server_address")]
    server_address: String,

    /// Poll interval, in seconds.
    #[serde(default = "default_poll_interval")]
    poll_interval: u64,

    /// Report interval, in seconds.
    #[serde(default = "default_report_interval")]
    report_interval: u64,

    /// Number of delivery workers.
    #[serde(default = "default_num_workers")]
    num_workers: usize,

    /// Capacity of the job queue. Defaults to the number of workers.
    #[serde(default)]
    job_queue_capacity: Option<usize>,

    /// Log level or filter directives.
    #[serde(default)]
    log_level: LogLevel,

    /// Whether to write logs as JSON.
    #[serde(default)]
    log_format_json: bool,

    /// How metrics are encoded in update requests.
    #[serde(default)]
    api_mode: ApiMode,

    /// Request timeout, in seconds.
    #[serde(default = "default_request_timeout")]
    request_timeout: u64,

    /// How long to wait for in-flight metrics to be delivered on shutdown, in seconds.
    #[serde(default = "default_shutdown_grace_period")]
    shutdown_grace_period: u64,
}

impl AgentConfiguration {
    /// Loads the agent configuration.
    ///
    /// Sources, from lowest to highest precedence: built-in defaults, the configuration file given by `--config`,
    /// command-line flags, `TALLY_`-prefixed environment variables, and then the bare `ADDRESS`, `POLL_INTERVAL`,
    /// `REPORT_INTERVAL`, `NUM_WORKERS`, and `LOG_LEVEL` environment variables. A bare numeric variable that does not
    /// parse is ignored.
    ///
    /// # Errors
    ///
    /// If the configuration file cannot be read, or any value is of the wrong type, an error is returned.
    pub fn load(cli: &Cli) -> Result<Self, ConfigurationError> {
        let mut loader = ConfigurationLoader::default();
        if let Some(path) = &cli.config {
            loader = loader.from_yaml(path)?;
        }

        loader
            .with_overrides(cli.clone())
            .from_environment("tally")?
            .from_environment_aliases(&environment_aliases())?
            .into_typed()
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn api_mode(&self) -> ApiMode {
        self.api_mode
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period)
    }

    pub fn logging_configuration(&self) -> LoggingConfiguration {
        LoggingConfiguration::new(self.log_level.clone(), self.log_format_json)
    }

    /// Returns the pipeline configuration.
    ///
    /// This is not validated here: invalid values are rejected when the pipeline is created.
    pub fn pipeline_configuration(&self) -> PipelineConfiguration {
        let config = PipelineConfiguration::new(
            Duration::from_secs(self.poll_interval),
            Duration::from_secs(self.report_interval),
            self.num_workers,
        );

        match self.job_queue_capacity {
            Some(capacity) => config.with_job_queue_capacity(capacity),
            None => config,
        }
    }
}
