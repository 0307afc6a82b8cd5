use crate::consumer::{Consume, Consumer};
use crate::producer::{Produce, Producer};
use crate::runtime::telemetry::{self, QueueGauge, Telemetry};
use crate::worker::WorkerHooks;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Object-safe view of a worker handle owned by a [`Runner`].
pub trait Managed: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()>;

    /// Ends the run gracefully. Consumers flush what is still queued first.
    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>>;

    fn telemetry(&self) -> Arc<Telemetry>;

    fn queue_gauge(&self) -> Option<Arc<dyn QueueGauge>> {
        None
    }
}

impl<W, H> Managed for Producer<W, H>
where
    W: Produce,
    H: WorkerHooks<W::Output, W::Message>,
{
    fn name(&self) -> &str {
        Producer::name(self)
    }

    fn start(&mut self) -> Result<()> {
        Producer::start(self)
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>> {
        self.stop().boxed()
    }

    fn telemetry(&self) -> Arc<Telemetry> {
        Producer::telemetry(self)
    }
}

impl<W, H> Managed for Consumer<W, H>
where
    W: Consume,
    H: WorkerHooks<W::Output, W::Message>,
{
    fn name(&self) -> &str {
        Consumer::name(self)
    }

    fn start(&mut self) -> Result<()> {
        Consumer::start(self)
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>> {
        self.drain().boxed()
    }

    fn telemetry(&self) -> Arc<Telemetry> {
        Consumer::telemetry(self)
    }

    fn queue_gauge(&self) -> Option<Arc<dyn QueueGauge>> {
        let queue: Arc<dyn QueueGauge> = self.get_work_queue();
        Some(queue)
    }
}

/// Starts and stops a group of producers and consumers in dependency order
/// and handles OS signals for graceful shutdowns.
///
/// Consumers start before producers so no early item is skipped; on stop,
/// producers go first and consumers then flush what is still queued.
pub struct Runner {
    producers: Vec<Box<dyn Managed>>,
    consumers: Vec<Box<dyn Managed>>,
    shutdown: CancellationToken,
    run_token: Option<CancellationToken>,
    metrics_interval: Option<Duration>,
    reporters: Vec<JoinHandle<()>>,
    started: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            producers: Vec::new(),
            consumers: Vec::new(),
            shutdown: CancellationToken::new(),
            run_token: None,
            metrics_interval: None,
            reporters: Vec::new(),
            started: false,
        }
    }

    /// Logs a metrics snapshot per worker at `interval` while running.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    /// Same as [`Runner::with_metrics_interval`] with the default interval.
    pub fn with_metrics(self) -> Self {
        self.with_metrics_interval(telemetry::DEFAULT_METRICS_INTERVAL)
    }

    pub fn add_producer<W, H>(&mut self, producer: Producer<W, H>) -> &mut Self
    where
        W: Produce,
        H: WorkerHooks<W::Output, W::Message>,
    {
        self.producers.push(Box::new(producer));
        self
    }

    pub fn add_consumer<W, H>(&mut self, consumer: Consumer<W, H>) -> &mut Self
    where
        W: Consume,
        H: WorkerHooks<W::Output, W::Message>,
    {
        self.consumers.push(Box::new(consumer));
        self
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Starts every consumer, then every producer. If one fails to start,
    /// the workers already started are stopped again and the error returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        if let Err(err) = self.start_all() {
            self.started = true;
            if let Err(stop_err) = self.stop().await {
                tracing::warn!(error = %stop_err, "failed to unwind partially started runner");
            }
            return Err(err);
        }

        let run_token = self.shutdown.child_token();
        if let Some(interval) = self.metrics_interval {
            for worker in self.consumers.iter().chain(self.producers.iter()) {
                self.reporters.push(telemetry::spawn_metrics_reporter(
                    worker.name().to_string(),
                    worker.telemetry(),
                    worker.queue_gauge(),
                    run_token.clone(),
                    interval,
                ));
            }
        }
        self.run_token = Some(run_token);
        self.started = true;

        tracing::info!(
            producers = self.producers.len(),
            consumers = self.consumers.len(),
            "runner started"
        );
        Ok(())
    }

    fn start_all(&mut self) -> Result<()> {
        for worker in self.consumers.iter_mut().chain(self.producers.iter_mut()) {
            worker.start()?;
        }
        Ok(())
    }

    /// Stops producers, then drains consumers. Every worker is stopped even
    /// when an earlier one reports a failure; the first failure is returned.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let mut first_error = None;
        for worker in self.producers.iter_mut().chain(self.consumers.iter_mut()) {
            let result = worker.shutdown().await;
            if let Err(err) = result {
                tracing::warn!(worker = %worker.name(), error = %err, "worker ended with an error");
                first_error.get_or_insert(err);
            }
        }

        if let Some(token) = self.run_token.take() {
            token.cancel();
        }
        for handle in self.reporters.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        self.started = false;
        tracing::info!("runner stopped");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        let result = self.stop().await;
        self.shutdown = CancellationToken::new();
        result
    }
}
