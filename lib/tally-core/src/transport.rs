use std::sync::Arc;

use async_trait::async_trait;
use tally_error::GenericError;

use crate::Metric;

/// Delivers metrics to a remote collector.
///
/// Each call delivers exactly one metric and either fully succeeds or fully fails. Implementations may block for as
/// long as the underlying I/O takes: the pipeline imposes no timeout of its own, so a call that never returns takes
/// one worker out of rotation for good. Transports that talk to the network should bound their requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers `metric`.
    ///
    /// # Errors
    ///
    /// If the metric could not be delivered, an error is returned. The pipeline does not retry.
    async fn deliver(&self, metric: Metric) -> Result<(), GenericError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn deliver(&self, metric: Metric) -> Result<(), GenericError> {
        self.as_ref().deliver(metric).await
    }
}
