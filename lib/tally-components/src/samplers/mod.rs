//! Samplers.

mod poll_count;
pub use self::poll_count::PollCountSampler;

#[cfg(target_os = "linux")]
mod procfs;

mod runtime;
pub use self::runtime::RuntimeSampler;
