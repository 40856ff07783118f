use crate::Metric;

/// A source of metric snapshots.
///
/// Samplers are invoked synchronously by the collector loop on every poll tick, in registration order, and must be
/// fast: a slow sampler delays the next tick for every other sampler. Each call should return the same set of metric
/// names with freshly measured values.
///
/// Sampling cannot fail. A measurement that cannot be taken is left out of the returned snapshot instead.
///
/// Samplers take `&mut self` so that they may keep reusable scratch state, such as read buffers, between calls. Any
/// `FnMut() -> Vec<Metric>` closure is also a sampler.
pub trait Sampler: Send {
    /// Returns a name for this sampler, used in log output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Takes a snapshot.
    fn sample(&mut self) -> Vec<Metric>;
}

impl<F> Sampler for F
where
    F: FnMut() -> Vec<Metric> + Send,
{
    fn sample(&mut self) -> Vec<Metric> {
        self()
    }
}
