//! Producers call `work` at a fixed cadence and broadcast every result to
//! their subscribed queues.

use crate::channel::{MessagePipe, MessageSender};
use crate::host::kind_of;
use crate::queue::{PushOutcome, WorkQueue};
use crate::runtime::config::WorkerConfig;
use crate::runtime::telemetry::Telemetry;
use crate::worker::{
    pause_until, Lifecycle, Payload, QueueSide, RelayScope, Role, RunParts, RunState, Session,
    WorkArgs, WorkerCallbacks, WorkerCore, WorkerExit, WorkerHooks,
};
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Callbacks of a producer. `work` is mandatory.
pub trait Produce: WorkerCallbacks {
    /// Emitted by every `work` call; cloned once per subscribed queue.
    type Output: Payload + Clone;

    fn work(
        context: &mut Self::Context,
        state: &mut RunState<Self::State>,
        pipe: &mut MessagePipe<Self::Message>,
        args: &WorkArgs,
    ) -> Result<Self::Output>;
}

/// The queues a producer run feeds, in subscription order.
struct Subscribers<T>(Vec<Arc<WorkQueue<T>>>);

impl<T: Payload + Clone> QueueSide<T> for Subscribers<T> {
    fn deliver<'a>(&'a self, output: T, scope: &'a RelayScope) -> BoxFuture<'a, T> {
        Box::pin(fan_out(scope, &self.0, output))
    }
}

/// Controller handle of a producer.
///
/// Dropping the handle requests the active run to stop.
pub struct Producer<W: Produce, H = ()> {
    core: WorkerCore<W::Output, W::Message, H>,
    subscribers: Vec<Arc<WorkQueue<W::Output>>>,
    _callbacks: PhantomData<fn() -> W>,
}

impl<W, H> Producer<W, H>
where
    W: Produce,
    H: WorkerHooks<W::Output, W::Message>,
{
    pub fn new(config: WorkerConfig, hooks: H) -> Self {
        Self {
            core: WorkerCore::new(config, hooks),
            subscribers: Vec::new(),
            _callbacks: PhantomData,
        }
    }

    /// Shares `telemetry` with other handles, e.g. to aggregate several workers.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.core.set_telemetry(telemetry);
        self
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn hooks(&self) -> &H {
        self.core.hooks()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.core.telemetry()
    }

    /// Replaces the queues fed by the next run. Rejected while a run is active.
    pub fn set_subscribers(&mut self, queues: Vec<Arc<WorkQueue<W::Output>>>) -> Result<()> {
        self.ensure_idle()?;
        self.subscribers = queues;
        Ok(())
    }

    pub fn add_subscriber(&mut self, queue: Arc<WorkQueue<W::Output>>) -> Result<()> {
        self.ensure_idle()?;
        self.subscribers.push(queue);
        Ok(())
    }

    pub fn subscribers(&self) -> &[Arc<WorkQueue<W::Output>>] {
        &self.subscribers
    }

    /// Starts a new run with `args` merged over the configured work args.
    pub fn start_new(&mut self, args: WorkArgs) -> Result<()> {
        let subscribers = Subscribers(self.subscribers.clone());
        self.core
            .launch(Role::Producer, kind_of::<W>(), &args, 0, subscribers)
    }

    pub fn start(&mut self) -> Result<()> {
        self.start_new(WorkArgs::new())
    }

    pub fn set_stopped(&self) {
        self.core.set_stopped();
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    pub fn send_message(&self, message: W::Message) -> Result<()> {
        self.core.send_message(message)
    }

    pub fn message_sender(&self) -> Option<MessageSender<W::Message>> {
        self.core.message_sender()
    }

    /// Waits for the current run to end and returns its first failure.
    pub async fn join(&mut self) -> Result<()> {
        self.core.join().await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.set_stopped();
        self.join().await
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.core.is_active() {
            bail!(
                "cannot change subscribers of producer `{}` while it is {}",
                self.name(),
                self.lifecycle()
            );
        }
        Ok(())
    }
}

/// The producer loop, run inside the worker process.
pub(crate) async fn run_producer<W: Produce>(parts: RunParts<W::Message>) -> WorkerExit {
    let mut session = Session::<W>::new(parts);
    let Some(mut context) = session.start() else {
        return session.exit();
    };

    tracing::debug!(worker = %session.worker(), "producer loop running");

    while session.control().is_running() {
        let started = Instant::now();
        let Some(output) =
            session.work(|state, pipe, args| W::work(&mut context, state, pipe, args))
        else {
            break;
        };

        if !session.produce(&output).await {
            break;
        }

        pause_until(deadline(started, session.work_timeout()), session.signal()).await;
    }

    session.finish(&mut context);
    session.exit()
}

/// Pushes `output` into every ready queue, in subscription order. A push
/// blocked on a full lossless queue is abandoned once a stop is requested,
/// and one whose consumer stopped meanwhile is turned away.
async fn fan_out<T: Clone>(scope: &RelayScope, subscribers: &[Arc<WorkQueue<T>>], output: T) -> T {
    let telemetry = &scope.telemetry;
    let mut pushed = 0;

    for (index, queue) in subscribers.iter().enumerate() {
        if !queue.is_ready() {
            telemetry.record_item_skipped();
            tracing::trace!(worker = %scope.worker, queue = index, "subscriber not ready; skipping");
            continue;
        }

        tokio::select! {
            biased;
            outcome = queue.push_if_ready(output.clone()) => match outcome {
                PushOutcome::Enqueued => pushed += 1,
                PushOutcome::EvictedOldest => {
                    pushed += 1;
                    tracing::trace!(worker = %scope.worker, queue = index, "subscriber full; oldest item evicted");
                }
                PushOutcome::NotReady => {
                    telemetry.record_item_skipped();
                    tracing::debug!(worker = %scope.worker, queue = index, "subscriber stopped while the push waited; item dropped");
                }
            },
            _ = scope.signal().cancelled() => {
                telemetry.record_item_skipped();
                tracing::debug!(
                    worker = %scope.worker,
                    queue = index,
                    "stop requested while blocked on a full queue; item abandoned"
                );
                break;
            }
        }
    }

    telemetry.record_items_pushed(pushed);
    output
}

fn deadline(started: Instant, period: Duration) -> Instant {
    started
        .checked_add(period)
        .unwrap_or_else(|| started + Duration::from_secs(86_400 * 365 * 30))
}
