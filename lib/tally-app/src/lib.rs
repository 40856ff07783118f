//! High-level application primitives.
//!
//! This crate provides the pieces needed to bootstrap the agent before the pipeline starts, such as initializing
//! logging.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LogLevel, LoggingConfiguration};
}
