use std::time::Duration;

use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Metric, Sampler};

/// Drives the registered samplers on a fixed poll interval.
///
/// On every tick, each sampler is invoked in registration order and every metric it returns is sent, one at a time, to
/// the metrics channel. Sending waits for capacity, so a dispatcher that falls behind stalls the collector rather
/// than causing metrics to be dropped.
///
/// The loop stops when the shutdown token is cancelled or when the receiving side of the metrics channel goes away.
/// Either way, the metrics channel is closed on return. A metric whose send was still waiting for capacity when
/// cancellation was observed is not emitted.
pub(super) struct CollectorLoop {
    samplers: Vec<Box<dyn Sampler>>,
    poll_interval: Duration,
    metrics_tx: mpsc::Sender<Metric>,
}

impl CollectorLoop {
    pub fn new(samplers: Vec<Box<dyn Sampler>>, poll_interval: Duration, metrics_tx: mpsc::Sender<Metric>) -> Self {
        Self {
            samplers,
            poll_interval,
            metrics_tx,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        // The first tick happens one full interval after start, rather than immediately.
        let mut poll = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = 0u64;
        let mut emitted = 0u64;

        debug!(
            samplers = self.samplers.len(),
            poll_interval = ?self.poll_interval,
            "Collector loop started."
        );

        'collect: loop {
            select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Received shutdown signal.");
                    break;
                },
                _ = poll.tick() => {
                    ticks += 1;

                    for sampler in self.samplers.iter_mut() {
                        let metrics = sampler.sample();
                        trace!(sampler = sampler.name(), metrics_len = metrics.len(), "Sampled metrics.");

                        for metric in metrics {
                            select! {
                                biased;

                                result = self.metrics_tx.send(metric) => if result.is_err() {
                                    debug!("Metrics channel closed. Stopping collector loop.");
                                    break 'collect;
                                },
                                _ = shutdown.cancelled() => {
                                    debug!("Received shutdown signal while waiting for metrics channel capacity.");
                                    break 'collect;
                                },
                            }

                            emitted += 1;
                        }
                    }
                },
            }
        }

        debug!(ticks, emitted, "Collector loop stopped.");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio::time::sleep;

    use super::*;

    fn counting_sampler(name: &'static str, calls: Arc<AtomicUsize>) -> Box<dyn Sampler> {
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            vec![Metric::counter(name, 1)]
        })
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_within_jitter_bounds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (metrics_tx, mut metrics_rx) = mpsc::channel(100);
        let shutdown = CancellationToken::new();

        let collector = CollectorLoop::new(
            vec![counting_sampler("x", Arc::clone(&calls))],
            Duration::from_millis(100),
            metrics_tx,
        );
        let handle = tokio::spawn(collector.run(shutdown.clone()));

        let drain = tokio::spawn(async move {
            let mut received = 0;
            while metrics_rx.recv().await.is_some() {
                received += 1;
            }
            received
        });

        sleep(Duration::from_millis(1050)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // Ten full intervals elapsed, with one tick of tolerance either way.
        let ticks = calls.load(Ordering::SeqCst);
        assert!((9..=11).contains(&ticks), "unexpected tick count: {}", ticks);

        // Every sampled metric made it onto the channel, and the channel was closed on return.
        let received = drain.await.unwrap();
        assert_eq!(received, ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn samplers_emit_in_registration_order() {
        let (metrics_tx, mut metrics_rx) = mpsc::channel(100);
        let shutdown = CancellationToken::new();

        let gauges: Box<dyn Sampler> = Box::new(|| vec![Metric::gauge("a", 1.0), Metric::gauge("b", 2.0)]);
        let counters: Box<dyn Sampler> = Box::new(|| vec![Metric::counter("c", 1)]);

        let collector = CollectorLoop::new(vec![gauges, counters], Duration::from_secs(1), metrics_tx);
        let handle = tokio::spawn(collector.run(shutdown.clone()));

        sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let mut names = Vec::new();
        while let Some(metric) = metrics_rx.recv().await {
            names.push(metric.name().to_string());
        }
        assert_eq!(names, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_channel_does_not_block_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (metrics_tx, metrics_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let collector = CollectorLoop::new(
            vec![counting_sampler("x", Arc::clone(&calls))],
            Duration::from_millis(10),
            metrics_tx,
        );
        let handle = tokio::spawn(collector.run(shutdown.clone()));

        // Nobody reads, so the collector ends up parked on a full channel.
        sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("collector should stop promptly")
            .unwrap();

        // Backpressure: the collector stopped sampling once the channel was full.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        drop(metrics_rx);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_receiver_dropped() {
        let (metrics_tx, metrics_rx) = mpsc::channel(10);
        drop(metrics_rx);

        let sampler: Box<dyn Sampler> = Box::new(|| vec![Metric::gauge("a", 1.0)]);
        let collector = CollectorLoop::new(vec![sampler], Duration::from_millis(10), metrics_tx);

        tokio::time::timeout(Duration::from_secs(1), collector.run(CancellationToken::new()))
            .await
            .expect("collector should stop once nothing is listening");
    }
}
