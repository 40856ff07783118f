use std::time::Duration;

use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::Metric;

/// Why the dispatcher stopped accepting metrics.
#[derive(Debug, Eq, PartialEq)]
enum Stop {
    /// The collector loop closed the metrics channel.
    InputClosed,

    /// The shutdown token was cancelled.
    Shutdown,

    /// The job queue has no receivers left, so nothing could be delivered anyway.
    QueueClosed,
}

/// Batches metrics between report ticks and flushes them onto the job queue.
///
/// Metrics are appended to a private batch as they arrive. The batch is flushed, in arrival order, when the report
/// interval ticks and when the dispatcher stops. There is no size-based flush. Pushing onto the job queue waits for
/// capacity, one metric at a time.
///
/// When the metrics channel closes or shutdown is signalled, the dispatcher takes whatever is still buffered in the
/// metrics channel, performs one final flush, and closes the job queue by dropping its sender. If both a report tick
/// and channel closure are ready at the same time, closure is handled first.
pub(super) struct Dispatcher {
    metrics_rx: mpsc::Receiver<Metric>,
    report_interval: Duration,
    jobs_tx: flume::Sender<Metric>,
    batch: Vec<Metric>,
}

impl Dispatcher {
    pub fn new(metrics_rx: mpsc::Receiver<Metric>, report_interval: Duration, jobs_tx: flume::Sender<Metric>) -> Self {
        Self {
            metrics_rx,
            report_interval,
            jobs_tx,
            batch: Vec::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut report = interval_at(Instant::now() + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut flushes = 0u64;
        let mut flushed = 0u64;

        debug!(report_interval = ?self.report_interval, "Dispatcher started.");

        let stop = loop {
            select! {
                biased;

                maybe_metric = self.metrics_rx.recv() => match maybe_metric {
                    Some(metric) => {
                        trace!(%metric, "Buffered metric.");
                        self.batch.push(metric);
                    },
                    None => {
                        debug!("Metrics channel closed.");
                        break Stop::InputClosed;
                    },
                },
                _ = shutdown.cancelled() => {
                    debug!("Received shutdown signal.");
                    break Stop::Shutdown;
                },
                _ = report.tick() => {
                    if self.batch.is_empty() {
                        continue;
                    }

                    flushes += 1;
                    match self.flush().await {
                        Some(n) => flushed += n,
                        None => break Stop::QueueClosed,
                    }
                },
            }
        };

        if stop == Stop::Shutdown {
            // Refuse further sends, but keep whatever the collector already handed over.
            self.metrics_rx.close();
            while let Some(metric) = self.metrics_rx.recv().await {
                self.batch.push(metric);
            }
        }

        if stop != Stop::QueueClosed && !self.batch.is_empty() {
            flushes += 1;
            if let Some(n) = self.flush().await {
                flushed += n;
            }
        }

        debug!(flushes, flushed, "Dispatcher stopped.");
    }

    /// Pushes every buffered metric onto the job queue, in order, and clears the batch.
    ///
    /// Returns the number of metrics flushed, or `None` if the job queue was closed. The batch keeps its capacity.
    async fn flush(&mut self) -> Option<u64> {
        let batch_len = self.batch.len();

        for metric in self.batch.drain(..) {
            if self.jobs_tx.send_async(metric).await.is_err() {
                error!(batch_len, "Job queue closed with no workers remaining. Dropping batch.");
                return None;
            }
        }

        debug!(batch_len, "Flushed batch to job queue.");
        Some(batch_len as u64)
    }
}
