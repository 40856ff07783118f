//! Samplers and transports for the Tally metrics agent.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod samplers;
pub mod transports;
