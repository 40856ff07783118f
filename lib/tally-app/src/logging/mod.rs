//! Logging.

use tally_error::GenericError;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

mod layer;
use self::layer::build_formatting_layer;

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered by the configured log level, which accepts the same directives as `RUST_LOG` (for example,
/// `info` or `tally_core=debug,info`), and are written to standard output either in a human-readable format or as one
/// JSON object per line.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    tracing_subscriber::registry()
        .with(config.log_level().as_env_filter())
        .with(build_formatting_layer(config, std::io::stdout))
        .try_init()?;

    Ok(())
}
