use crate::queue::WorkQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// It writes to stderr: a worker process's stdout carries its frames, while its
/// stderr is shared with the controller. Calling this function multiple times
/// is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Per-worker counters, kept on the controller. Shared between the handle,
/// the relay serving the worker process and the monitors, so every field is
/// atomic.
#[derive(Default, Debug)]
pub struct Telemetry {
    work_calls: AtomicU64,
    items_pushed: AtomicU64,
    items_skipped: AtomicU64,
    items_discarded: AtomicU64,
    results_forwarded: AtomicU64,
    results_delivered: AtomicU64,
    messages_delivered: AtomicU64,
    failures: AtomicU64,
}

impl Telemetry {
    pub fn record_work_call(&self) {
        self.work_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_items_pushed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.items_pushed.fetch_add(count, Ordering::Relaxed);
    }

    /// Item not pushed because the target queue had no running consumer, or
    /// because a stop interrupted a blocked push.
    pub fn record_item_skipped(&self) {
        self.items_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_items_discarded(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.items_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_result_forwarded(&self) {
        self.results_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_delivered(&self) {
        self.results_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            work_calls: self.work_calls.load(Ordering::Relaxed),
            items_pushed: self.items_pushed.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            items_discarded: self.items_discarded.load(Ordering::Relaxed),
            results_forwarded: self.results_forwarded.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn work_calls(&self) -> u64 {
        self.work_calls.load(Ordering::Relaxed)
    }

    pub fn items_discarded(&self) -> u64 {
        self.items_discarded.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub work_calls: u64,
    pub items_pushed: u64,
    pub items_skipped: u64,
    pub items_discarded: u64,
    pub results_forwarded: u64,
    pub results_delivered: u64,
    pub messages_delivered: u64,
    pub failures: u64,
}

/// Queue readings the metrics reporter includes next to the counters.
pub trait QueueGauge: Send + Sync {
    fn depth(&self) -> usize;
    fn evicted(&self) -> u64;
}

impl<T: Send> QueueGauge for WorkQueue<T> {
    fn depth(&self) -> usize {
        self.len()
    }

    fn evicted(&self) -> u64 {
        WorkQueue::evicted(self)
    }
}

/// Spawns a background task that periodically logs a worker's call rate,
/// counters and (for consumers) queue depth and evictions.
pub fn spawn_metrics_reporter(
    worker: String,
    telemetry: Arc<Telemetry>,
    queue: Option<Arc<dyn QueueGauge>>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "prodcon::metrics", worker = %worker, "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let calls_delta = current.work_calls.saturating_sub(last_snapshot.work_calls);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let call_rate = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        calls_delta as f64 / elapsed
                    };
                    let (queue_depth, queue_evicted) = queue
                        .as_ref()
                        .map(|queue| (queue.depth(), queue.evicted()))
                        .unwrap_or((0, 0));

                    tracing::info!(
                        target: "prodcon::metrics",
                        worker = %worker,
                        call_rate = format!("{call_rate:.2}"),
                        work_calls = current.work_calls,
                        items_pushed = current.items_pushed,
                        items_skipped = current.items_skipped,
                        items_discarded = current.items_discarded,
                        results_forwarded = current.results_forwarded,
                        results_delivered = current.results_delivered,
                        messages_delivered = current.messages_delivered,
                        failures = current.failures,
                        queue_depth,
                        queue_evicted,
                        "worker metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
