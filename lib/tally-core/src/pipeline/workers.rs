use std::{num::NonZeroUsize, sync::Arc};

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, debug_span, error, trace, warn};

use super::DeliveryError;
use crate::{task::JoinSetExt as _, Metric, Transport};

/// A fixed-size pool of workers delivering jobs from a shared queue.
///
/// Each job is taken by exactly one worker and delivered exactly once. Workers do not retry, and do not hand failed
/// jobs back to the queue: a failure is reported on the error channel and the worker moves on. Reporting an error waits
/// for capacity on the error channel.
///
/// Workers keep draining the queue until it is both closed and empty, even after shutdown has been signalled. The
/// error channel closes once every worker has exited.
pub(super) struct WorkerPool {
    worker_count: NonZeroUsize,
    jobs_rx: flume::Receiver<Metric>,
    transport: Arc<dyn Transport>,
    errors_tx: mpsc::Sender<DeliveryError>,
}

impl WorkerPool {
    pub fn new(
        worker_count: NonZeroUsize, jobs_rx: flume::Receiver<Metric>, transport: Arc<dyn Transport>,
        errors_tx: mpsc::Sender<DeliveryError>,
    ) -> Self {
        Self {
            worker_count,
            jobs_rx,
            transport,
            errors_tx,
        }
    }

    pub async fn run(self) {
        let Self {
            worker_count,
            jobs_rx,
            transport,
            errors_tx,
        } = self;

        debug!(worker_count = worker_count.get(), "Starting worker pool.");

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count.get() {
            workers.spawn_in_span(
                debug_span!("worker", worker_id),
                run_worker(jobs_rx.clone(), Arc::clone(&transport), errors_tx.clone()),
            );
        }

        // Only the workers hold onto the queue and the error channel from here on, so that the error channel closes
        // exactly when the last worker exits.
        drop(jobs_rx);
        drop(errors_tx);

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed to run to completion.");
            }
        }

        debug!("All workers stopped.");
    }
}

async fn run_worker(
    jobs_rx: flume::Receiver<Metric>, transport: Arc<dyn Transport>, errors_tx: mpsc::Sender<DeliveryError>,
) {
    let mut delivered = 0u64;
    let mut failed = 0u64;

    while let Ok(metric) = jobs_rx.recv_async().await {
        let metric_name = Arc::clone(metric.name());

        match transport.deliver(metric).await {
            Ok(()) => {
                trace!(metric = %metric_name, "Delivered metric.");
                delivered += 1;
            }
            Err(e) => {
                warn!(metric = %metric_name, error = %e, "Failed to deliver metric.");
                failed += 1;

                if errors_tx.send(DeliveryError::new(metric_name, e)).await.is_err() {
                    trace!("Error channel closed. Delivery error not reported.");
                }
            }
        }
    }

    debug!(delivered, failed, "Job queue closed. Worker stopped.");
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use tally_error::{generic_error, GenericError};
    use tokio::time::timeout;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        delivered: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingTransport {
        fn failing_on(name: &'static str) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail_on: Some(name),
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(&self, metric: Metric) -> Result<(), GenericError> {
            tokio::task::yield_now().await;
            self.delivered.lock().unwrap().push(metric.name().to_string());

            if self.fail_on == Some(metric.name().as_ref()) {
                return Err(generic_error!("collector rejected {}", metric.name()));
            }
            Ok(())
        }
    }

    fn nonzero(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_job_delivered_exactly_once() {
        for worker_count in [1, 3, 8] {
            let transport = Arc::new(RecordingTransport::default());
            let (jobs_tx, jobs_rx) = flume::bounded(64);
            let (errors_tx, mut errors_rx) = mpsc::channel(16);

            for i in 0..50 {
                jobs_tx.send(Metric::counter(format!("job-{}", i), 1)).unwrap();
            }
            drop(jobs_tx);

            let pool = WorkerPool::new(nonzero(worker_count), jobs_rx, transport.clone(), errors_tx);
            timeout(Duration::from_secs(5), pool.run()).await.unwrap();

            let mut counts: HashMap<String, usize> = HashMap::new();
            for name in transport.delivered() {
                *counts.entry(name).or_default() += 1;
            }
            assert_eq!(counts.len(), 50, "worker_count = {}", worker_count);
            assert!(counts.values().all(|&n| n == 1), "worker_count = {}", worker_count);

            // No failures, and the error channel closed once the workers exited.
            assert!(errors_rx.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn failed_jobs_are_reported_and_not_retried() {
        let transport = Arc::new(RecordingTransport::failing_on("bad"));
        let (jobs_tx, jobs_rx) = flume::bounded(8);
        let (errors_tx, mut errors_rx) = mpsc::channel(16);

        for name in ["ok-1", "bad", "ok-2"] {
            jobs_tx.send(Metric::gauge(name, 1.0)).unwrap();
        }
        drop(jobs_tx);

        let pool = WorkerPool::new(nonzero(2), jobs_rx, transport.clone(), errors_tx);
        timeout(Duration::from_secs(5), pool.run()).await.unwrap();

        let error = errors_rx.recv().await.expect("one delivery error");
        assert_eq!(error.metric_name(), "bad");
        assert!(errors_rx.recv().await.is_none());

        let mut delivered = transport.delivered();
        delivered.sort();
        assert_eq!(delivered, vec!["bad", "ok-1", "ok-2"]);
    }

    #[tokio::test]
    async fn single_worker_preserves_queue_order() {
        let transport = Arc::new(RecordingTransport::default());
        let (jobs_tx, jobs_rx) = flume::bounded(8);
        let (errors_tx, _errors_rx) = mpsc::channel(1);

        for name in ["a", "b", "c", "d"] {
            jobs_tx.send(Metric::gauge(name, 1.0)).unwrap();
        }
        drop(jobs_tx);

        let pool = WorkerPool::new(nonzero(1), jobs_rx, transport.clone(), errors_tx);
        timeout(Duration::from_secs(5), pool.run()).await.unwrap();

        assert_eq!(transport.delivered(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn workers_wait_for_queue_closure() {
        let transport = Arc::new(RecordingTransport::default());
        let (jobs_tx, jobs_rx) = flume::bounded(8);
        let (errors_tx, _errors_rx) = mpsc::channel(1);

        let pool = WorkerPool::new(nonzero(2), jobs_rx, transport.clone(), errors_tx);
        let handle = tokio::spawn(pool.run());

        // An empty but open queue keeps the workers alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        jobs_tx.send_async(Metric::gauge("late", 1.0)).await.unwrap();
        drop(jobs_tx);

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(transport.delivered(), vec!["late"]);
    }
}
