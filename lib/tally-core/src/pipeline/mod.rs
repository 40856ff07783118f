//! The telemetry pipeline.
//!
//! A pipeline is made up of four stages connected by bounded channels:
//!
//! - the collector loop, which invokes every registered [`Sampler`] on each poll tick
//! - the dispatcher, which batches metrics and flushes them onto the job queue on each report tick
//! - the worker pool, which delivers each job through the [`Transport`]
//! - the supervisor, [`RunningPipeline`], which waits for cancellation or the first delivery error
//!
//! Shutdown flows downstream. Cancelling the token stops the collector loop, the dispatcher performs a final flush and
//! closes the job queue, and the workers exit once the queue is empty. Metrics that reached the dispatcher before
//! shutdown are still delivered.
use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tally_error::GenericError;
use tokio::{select, sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, warn};

use crate::{task::spawn_in_span, Sampler, Transport};

mod collector;
use self::collector::CollectorLoop;

mod dispatcher;
use self::dispatcher::Dispatcher;

mod workers;
use self::workers::WorkerPool;

const DEFAULT_METRICS_CHANNEL_CAPACITY: usize = 100;
const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 100;

/// A failed delivery of a single metric.
///
/// Delivery errors are terminal for the metric in question: it is not retried.
#[derive(Debug, Snafu)]
#[snafu(display("Failed to deliver metric '{}': {}", metric_name, source))]
pub struct DeliveryError {
    metric_name: Arc<str>,
    source: GenericError,
}

impl DeliveryError {
    pub(crate) fn new(metric_name: Arc<str>, source: GenericError) -> Self {
        Self { metric_name, source }
    }

    /// Returns the name of the metric that could not be delivered.
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }
}

/// Pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PipelineError {
    /// The pipeline configuration is invalid.
    #[snafu(display("Invalid pipeline configuration: {}", reason))]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// A metric could not be delivered.
    #[snafu(display("{}", source))]
    Delivery {
        /// The first delivery error observed.
        source: DeliveryError,
    },
}

/// How a running pipeline stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// The shutdown token was cancelled.
    Cancelled,

    /// Every worker exited without a delivery error, and without the shutdown token being cancelled.
    Completed,
}

/// Pipeline configuration.
///
/// All durations and counts must be non-zero. The job queue holds as many jobs as there are workers unless configured
/// otherwise.
#[derive(Clone, Debug)]
pub struct PipelineConfiguration {
    poll_interval: Duration,
    report_interval: Duration,
    worker_count: usize,
    job_queue_capacity: Option<usize>,
    metrics_channel_capacity: usize,
    error_channel_capacity: usize,
}

impl PipelineConfiguration {
    /// Creates a new `PipelineConfiguration` with default channel capacities.
    pub fn new(poll_interval: Duration, report_interval: Duration, worker_count: usize) -> Self {
        Self {
            poll_interval,
            report_interval,
            worker_count,
            job_queue_capacity: None,
            metrics_channel_capacity: DEFAULT_METRICS_CHANNEL_CAPACITY,
            error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
        }
    }

    /// Sets the capacity of the job queue between the dispatcher and the workers.
    pub fn with_job_queue_capacity(mut self, capacity: usize) -> Self {
        self.job_queue_capacity = Some(capacity);
        self
    }

    /// Sets the capacity of the channel between the collector loop and the dispatcher.
    ///
    /// Defaults to 100.
    pub fn with_metrics_channel_capacity(mut self, capacity: usize) -> Self {
        self.metrics_channel_capacity = capacity;
        self
    }

    /// Sets the capacity of the channel on which workers report delivery errors.
    ///
    /// Defaults to 100.
    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity;
        self
    }

    /// Returns the poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the report interval.
    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }

    /// Returns the number of workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Returns the capacity of the job queue.
    pub fn job_queue_capacity(&self) -> usize {
        self.job_queue_capacity.unwrap_or(self.worker_count)
    }

    /// Returns the capacity of the metrics channel.
    pub fn metrics_channel_capacity(&self) -> usize {
        self.metrics_channel_capacity
    }

    /// Returns the capacity of the error channel.
    pub fn error_channel_capacity(&self) -> usize {
        self.error_channel_capacity
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// If any interval is zero or too large to schedule, or any count or capacity is zero, an error is returned.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let reason = if self.poll_interval.is_zero() {
            "poll interval must be greater than zero"
        } else if !is_schedulable(self.poll_interval) {
            "poll interval is too large"
        } else if self.report_interval.is_zero() {
            "report interval must be greater than zero"
        } else if !is_schedulable(self.report_interval) {
            "report interval is too large"
        } else if self.worker_count == 0 {
            "worker count must be at least one"
        } else if self.job_queue_capacity() == 0 {
            "job queue capacity must be at least one"
        } else if self.metrics_channel_capacity == 0 {
            "metrics channel capacity must be at least one"
        } else if self.error_channel_capacity == 0 {
            "error channel capacity must be at least one"
        } else {
            return Ok(());
        };

        InvalidConfiguration { reason }.fail()
    }
}

// Interval timers add the interval to the current deadline on every tick, and panic if that overflows.
fn is_schedulable(interval: Duration) -> bool {
    Instant::now()
        .checked_add(interval)
        .and_then(|first| first.checked_add(interval))
        .is_some()
}

/// A telemetry pipeline that has not been started yet.
pub struct Pipeline {
    config: PipelineConfiguration,
    worker_count: NonZeroUsize,
    samplers: Vec<Box<dyn Sampler>>,
    transport: Arc<dyn Transport>,
}

impl Pipeline {
    /// Creates a new `Pipeline` from the given configuration, delivering metrics through `transport`.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new(config: PipelineConfiguration, transport: Arc<dyn Transport>) -> Result<Self, PipelineError> {
        config.validate()?;

        let worker_count = NonZeroUsize::new(config.worker_count).context(InvalidConfiguration {
            reason: "worker count must be at least one",
        })?;

        Ok(Self {
            config,
            worker_count,
            samplers: Vec::new(),
            transport,
        })
    }

    /// Registers a sampler.
    ///
    /// Samplers are invoked in the order they are registered.
    pub fn add_sampler<S>(&mut self, sampler: S)
    where
        S: Sampler + 'static,
    {
        self.samplers.push(Box::new(sampler));
    }

    /// Registers a sampler, returning the pipeline.
    pub fn with_sampler<S>(mut self, sampler: S) -> Self
    where
        S: Sampler + 'static,
    {
        self.add_sampler(sampler);
        self
    }

    /// Starts every stage of the pipeline.
    ///
    /// Stages run on a child token of `shutdown`, and keep running in the background until it is cancelled, whether or
    /// not the returned [`RunningPipeline`] is still held.
    ///
    /// # Errors
    ///
    /// If no samplers have been registered, an error is returned and nothing is started.
    pub fn spawn(self, shutdown: &CancellationToken) -> Result<RunningPipeline, PipelineError> {
        if self.samplers.is_empty() {
            return InvalidConfiguration {
                reason: "at least one sampler must be registered",
            }
            .fail();
        }

        let Self {
            config,
            worker_count,
            samplers,
            transport,
        } = self;

        let shutdown = shutdown.child_token();
        let (metrics_tx, metrics_rx) = mpsc::channel(config.metrics_channel_capacity());
        let (jobs_tx, jobs_rx) = flume::bounded(config.job_queue_capacity());
        let (errors_tx, errors_rx) = mpsc::channel(config.error_channel_capacity());

        debug!(
            samplers = samplers.len(),
            poll_interval = ?config.poll_interval(),
            report_interval = ?config.report_interval(),
            worker_count = worker_count.get(),
            job_queue_capacity = config.job_queue_capacity(),
            "Starting pipeline."
        );

        let collector = CollectorLoop::new(samplers, config.poll_interval(), metrics_tx);
        let dispatcher = Dispatcher::new(metrics_rx, config.report_interval(), jobs_tx);
        let pool = WorkerPool::new(worker_count, jobs_rx, transport, errors_tx);

        let stages = vec![
            spawn_in_span(debug_span!("collector"), collector.run(shutdown.clone())),
            spawn_in_span(debug_span!("dispatcher"), dispatcher.run(shutdown.clone())),
            spawn_in_span(debug_span!("worker_pool"), pool.run()),
        ];

        Ok(RunningPipeline {
            shutdown,
            errors_rx,
            stages,
        })
    }

    /// Starts the pipeline and waits for it to stop.
    ///
    /// This is [`spawn`][Self::spawn] followed by [`RunningPipeline::wait`].
    ///
    /// # Errors
    ///
    /// If the pipeline cannot be started, or a metric could not be delivered, an error is returned.
    pub async fn run(self, shutdown: &CancellationToken) -> Result<Termination, PipelineError> {
        self.spawn(shutdown)?.wait().await
    }
}

/// A started pipeline.
pub struct RunningPipeline {
    shutdown: CancellationToken,
    errors_rx: mpsc::Receiver<DeliveryError>,
    stages: Vec<JoinHandle<()>>,
}

impl RunningPipeline {
    /// Waits for the pipeline to stop or fail.
    ///
    /// Returns `Termination::Cancelled` once the shutdown token is cancelled, or `Termination::Completed` if every
    /// worker exited without error. If both cancellation and a delivery error are ready, cancellation wins.
    ///
    /// This does not wait for the stages to exit. See [`drain`][Self::drain].
    ///
    /// # Errors
    ///
    /// If a metric could not be delivered, the first such error is returned immediately. The pipeline keeps running,
    /// and `wait` may be called again to wait for the next outcome.
    pub async fn wait(&mut self) -> Result<Termination, PipelineError> {
        select! {
            biased;

            _ = self.shutdown.cancelled() => {
                debug!("Pipeline cancelled.");
                Ok(Termination::Cancelled)
            },
            maybe_error = self.errors_rx.recv() => match maybe_error {
                Some(e) => Err(e).context(Delivery),
                None => {
                    debug!("All workers stopped without error.");
                    Ok(Termination::Completed)
                },
            },
        }
    }

    /// Waits for every stage of the pipeline to exit.
    ///
    /// Delivery errors observed while draining are logged rather than returned. Stages only exit after the shutdown
    /// token has been cancelled, so this does not resolve before then.
    pub async fn drain(self) {
        let Self {
            mut errors_rx, stages, ..
        } = self;

        let mut failed = 0u64;
        while let Some(e) = errors_rx.recv().await {
            warn!(error = %e, "Delivery failed while draining pipeline.");
            failed += 1;
        }

        for stage in stages {
            if let Err(e) = stage.await {
                error!(error = %e, "Pipeline stage failed to run to completion.");
            }
        }

        debug!(failed, "Pipeline drained.");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use tally_error::generic_error;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::Metric;

    #[derive(Default)]
    struct CountingTransport {
        delivered: Mutex<Vec<Metric>>,
        fail_on: Option<&'static str>,
    }

    impl CountingTransport {
        fn failing_on(name: &'static str) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail_on: Some(name),
            }
        }

        fn delivered(&self) -> Vec<Metric> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn deliver(&self, metric: Metric) -> Result<(), GenericError> {
            let failed = self.fail_on == Some(metric.name().as_ref());
            self.delivered.lock().unwrap().push(metric);

            if failed {
                return Err(generic_error!("rejected by collector"));
            }
            Ok(())
        }
    }

    fn config(poll_secs: u64, report_secs: u64, workers: usize) -> PipelineConfiguration {
        PipelineConfiguration::new(
            Duration::from_secs(poll_secs),
            Duration::from_secs(report_secs),
            workers,
        )
    }

    #[test]
    fn job_queue_capacity_follows_worker_count() {
        assert_eq!(config(1, 1, 4).job_queue_capacity(), 4);
        assert_eq!(config(1, 1, 4).with_job_queue_capacity(16).job_queue_capacity(), 16);
    }

    #[test]
    fn invalid_configuration_rejected() {
        let transport: Arc<dyn Transport> = Arc::new(CountingTransport::default());

        let cases = [
            (config(0, 1, 1), "poll interval"),
            (config(u64::MAX, 1, 1), "poll interval"),
            (config(1, 0, 1), "report interval"),
            (config(1, u64::MAX, 1), "report interval"),
            (config(1, 1, 0), "worker count"),
            (config(1, 1, 1).with_job_queue_capacity(0), "job queue capacity"),
            (config(1, 1, 1).with_metrics_channel_capacity(0), "metrics channel capacity"),
            (config(1, 1, 1).with_error_channel_capacity(0), "error channel capacity"),
        ];

        for (config, expected) in cases {
            match Pipeline::new(config, Arc::clone(&transport)) {
                Err(PipelineError::InvalidConfiguration { reason }) => {
                    assert!(reason.contains(expected), "'{}' should mention '{}'", reason, expected)
                }
                Err(e) => panic!("unexpected error: {}", e),
                Ok(_) => panic!("configuration should be rejected: {}", expected),
            }
        }
    }

    #[tokio::test]
    async fn spawn_without_samplers_rejected() {
        let pipeline = Pipeline::new(config(1, 1, 1), Arc::new(CountingTransport::default())).unwrap();
        let result = pipeline.spawn(&CancellationToken::new());
        assert!(matches!(result, Err(PipelineError::InvalidConfiguration { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_delivers_everything_collected() {
        let transport = Arc::new(CountingTransport::default());
        let shutdown = CancellationToken::new();

        let pipeline = Pipeline::new(config(1, 2, 1), transport.clone())
            .unwrap()
            .with_sampler(|| vec![Metric::counter("x", 1)]);
        let mut running = pipeline.spawn(&shutdown).unwrap();

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let termination = timeout(Duration::from_secs(30), running.wait()).await.unwrap().unwrap();
        assert_eq!(termination, Termination::Cancelled);

        timeout(Duration::from_secs(30), running.drain()).await.unwrap();

        let delivered = transport.delivered();
        assert!(
            (4..=5).contains(&delivered.len()),
            "unexpected delivery count: {}",
            delivered.len()
        );
        assert!(delivered.iter().all(|m| m.name().as_ref() == "x" && m.as_counter() == Some(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_delivery_error_returned() {
        let transport = Arc::new(CountingTransport::failing_on("bad"));
        let shutdown = CancellationToken::new();

        let pipeline = Pipeline::new(config(1, 1, 2), transport.clone())
            .unwrap()
            .with_sampler(|| vec![Metric::gauge("good", 1.0), Metric::gauge("bad", 2.0)]);
        let mut running = pipeline.spawn(&shutdown).unwrap();

        match timeout(Duration::from_secs(30), running.wait()).await.unwrap() {
            Err(PipelineError::Delivery { source }) => assert_eq!(source.metric_name(), "bad"),
            other => panic!("expected a delivery error, got {:?}", other),
        }

        // The pipeline keeps running after a delivery error.
        let before = transport.delivered().len();
        sleep(Duration::from_secs(3)).await;
        assert!(transport.delivered().len() > before);

        shutdown.cancel();
        timeout(Duration::from_secs(30), running.drain()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_parent_cancellation() {
        let transport = Arc::new(CountingTransport::default());
        let shutdown = CancellationToken::new();

        let pipeline = Pipeline::new(config(1, 1, 1), transport)
            .unwrap()
            .with_sampler(|| vec![Metric::counter("PollCount", 1)]);

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        let outcome = timeout(Duration::from_secs(30), pipeline.run(&shutdown)).await.unwrap();
        assert_eq!(outcome.unwrap(), Termination::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_error() {
        let (errors_tx, errors_rx) = mpsc::channel(1);
        errors_tx
            .send(DeliveryError::new("x".into(), generic_error!("boom")))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let mut running = RunningPipeline {
            shutdown,
            errors_rx,
            stages: Vec::new(),
        };
        assert_eq!(running.wait().await.unwrap(), Termination::Cancelled);
    }

    #[tokio::test]
    async fn closed_error_channel_completes() {
        let (errors_tx, errors_rx) = mpsc::channel::<DeliveryError>(1);
        drop(errors_tx);

        let calls = Arc::new(AtomicUsize::new(0));
        let stage_calls = Arc::clone(&calls);
        let stage = tokio::spawn(async move {
            stage_calls.fetch_add(1, Ordering::SeqCst);
        });

        let mut running = RunningPipeline {
            shutdown: CancellationToken::new(),
            errors_rx,
            stages: vec![stage],
        };
        assert_eq!(running.wait().await.unwrap(), Termination::Completed);

        running.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivery_error_display() {
        let error = PipelineError::Delivery {
            source: DeliveryError::new("PollCount".into(), generic_error!("connection refused")),
        };
        assert_eq!(
            error.to_string(),
            "Failed to deliver metric 'PollCount': connection refused"
        );
    }
}
