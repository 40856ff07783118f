//! Core primitives for the Tally metrics agent.
//!
//! This crate contains the agent-side telemetry pipeline: samplers produce [`Metric`]s on a fixed cadence, a batching
//! dispatcher accumulates them between report ticks, and a bounded pool of workers hands each one to a [`Transport`].
//! See [`pipeline`] for how the stages are wired together and how they shut down.
#![deny(warnings)]
#![deny(missing_docs)]

mod metric;
pub use self::metric::{Metric, MetricKind, MetricValue};

pub mod pipeline;

mod sampler;
pub use self::sampler::Sampler;

pub mod task;

mod transport;
pub use self::transport::Transport;
