use tally_core::{Metric, Sampler};

const POLL_COUNT: &str = "PollCount";

/// Counts how many times the agent has polled.
///
/// Emits a single `PollCount` counter with a delta of one on every call. The collector keeps the running total.
#[derive(Default)]
pub struct PollCountSampler {
    polls: u64,
}

impl PollCountSampler {
    /// Returns the number of times this sampler has been polled.
    pub fn polls(&self) -> u64 {
        self.polls
    }
}

impl Sampler for PollCountSampler {
    fn name(&self) -> &str {
        "poll_count"
    }

    fn sample(&mut self) -> Vec<Metric> {
        self.polls += 1;
        vec![Metric::counter(POLL_COUNT, 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_unit_delta_every_call() {
        let mut sampler = PollCountSampler::default();

        for _ in 0..3 {
            assert_eq!(sampler.sample(), vec![Metric::counter("PollCount", 1)]);
        }
        assert_eq!(sampler.polls(), 3);
    }
}
