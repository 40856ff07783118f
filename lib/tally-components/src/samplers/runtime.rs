use rand::Rng as _;
use tally_core::{Metric, Sampler};

#[cfg(target_os = "linux")]
use super::procfs::ProcfsReader;

const RANDOM_VALUE: &str = "RandomValue";

/// Process runtime statistics.
///
/// On Linux, this reports memory usage, thread count, context switches, page faults, and CPU time for the current
/// process as gauges, read from procfs. Any statistic that cannot be read is left out. Other platforms report no process
/// statistics.
///
/// A `RandomValue` gauge, uniformly distributed in `[0, 100)`, is always reported.
pub struct RuntimeSampler {
    #[cfg(target_os = "linux")]
    procfs: ProcfsReader,
}

impl RuntimeSampler {
    /// Creates a new `RuntimeSampler`.
    pub fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            procfs: ProcfsReader::new(),
        }
    }
}

impl Sampler for RuntimeSampler {
    fn name(&self) -> &str {
        "runtime"
    }

    fn sample(&mut self) -> Vec<Metric> {
        let mut metrics = Vec::with_capacity(16);

        #[cfg(target_os = "linux")]
        self.procfs.collect(&mut metrics);

        metrics.push(Metric::gauge(RANDOM_VALUE, rand::rng().random_range(0.0..100.0)));
        metrics
    }
}
