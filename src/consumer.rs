//! Consumers own a work queue and hand its items to `work` in batches.
//!
//! A batch is flushed when the buffer reaches `max_buffer_size` or when
//! `work_timeout` has elapsed since the previous call, whichever comes first.
//! With a zero timeout every arrival is processed right away and an idle
//! consumer simply waits. The queue stays on the controller; the worker
//! process asks for items over its pipe and buffers them itself.

use crate::channel::{MessagePipe, MessageSender};
use crate::host::kind_of;
use crate::queue::{BatchBuffer, WorkQueue};
use crate::runtime::config::ConsumerConfig;
use crate::runtime::telemetry::Telemetry;
use crate::worker::{
    Lifecycle, Payload, QueueSide, RelayScope, Role, RunParts, RunState, Session, WorkArgs,
    WorkerCallbacks, WorkerCore, WorkerExit, WorkerHooks,
};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callbacks of a consumer. `work` is mandatory.
pub trait Consume: WorkerCallbacks {
    type Item: Payload;
    type Output: Payload;

    /// Receives the whole buffer; `items` may be empty when the timeout
    /// trigger fires with nothing queued.
    fn work(
        items: Vec<Self::Item>,
        context: &mut Self::Context,
        state: &mut RunState<Self::State>,
        pipe: &mut MessagePipe<Self::Message>,
        args: &WorkArgs,
    ) -> Result<Self::Output>;
}

/// The consumer's queue, served to its worker process.
struct SourceQueue<I>(Arc<WorkQueue<I>>);

impl<I: Payload, O: Send + 'static> QueueSide<O> for SourceQueue<I> {
    fn take<'a>(
        &'a self,
        limit: usize,
        wait: Option<Duration>,
        scope: &'a RelayScope,
    ) -> BoxFuture<'a, Vec<Value>> {
        Box::pin(take_items(scope, &self.0, limit, wait))
    }

    fn retire<'a>(&'a self, buffered: usize, scope: &'a RelayScope) -> BoxFuture<'a, ()> {
        Box::pin(retire(scope, &self.0, buffered))
    }
}

/// Controller handle of a consumer.
///
/// Dropping the handle requests the active run to stop.
pub struct Consumer<W: Consume, H = ()> {
    core: WorkerCore<W::Output, W::Message, H>,
    queue: Arc<WorkQueue<W::Item>>,
    max_buffer_size: usize,
    _callbacks: PhantomData<fn() -> W>,
}

impl<W, H> Consumer<W, H>
where
    W: Consume,
    H: WorkerHooks<W::Output, W::Message>,
{
    pub fn new(config: ConsumerConfig, hooks: H) -> Self {
        let queue = Arc::new(WorkQueue::with_policy(
            config.queue_capacity(),
            config.lossy_queue(),
        ));
        Self {
            max_buffer_size: config.max_buffer_size(),
            core: WorkerCore::new(config.worker().clone(), hooks),
            queue,
            _callbacks: PhantomData,
        }
    }

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

    /// The queue producers subscribe to. Stays the same across runs.
    pub fn get_work_queue(&self) -> Arc<WorkQueue<W::Item>> {
        self.queue.clone()
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Starts a new run with `args` merged over the configured work args.
    /// The queue is marked ready before the run starts.
    pub fn start_new(&mut self, args: WorkArgs) -> Result<()> {
        let was_ready = self.queue.is_ready();
        if !self.core.is_active() {
            self.queue.set_ready(true);
        }

        let launched = self.core.launch(
            Role::Consumer,
            kind_of::<W>(),
            &args,
            self.max_buffer_size,
            SourceQueue(self.queue.clone()),
        );

        if launched.is_err() {
            self.queue.set_ready(was_ready);
        }
        launched
    }

    pub fn start(&mut self) -> Result<()> {
        self.start_new(WorkArgs::new())
    }

    /// Stops after the call in flight; items still buffered or queued are discarded.
    pub fn set_stopped(&self) {
        self.core.set_stopped();
    }

    /// Makes exactly one more `work` call with everything buffered or queued, then stops.
    pub fn set_stop_at_queue_end(&self) {
        self.core.set_draining();
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

    pub async fn join(&mut self) -> Result<()> {
        self.core.join().await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.set_stopped();
        self.join().await
    }

    pub async fn drain(&mut self) -> Result<()> {
        self.set_stop_at_queue_end();
        self.join().await
    }
}

/// The consumer loop, run inside the worker process. Items come from the
/// controller's queue one request at a time.
pub(crate) async fn run_consumer<W: Consume>(parts: RunParts<W::Message>) -> WorkerExit {
    let max_buffer_size = parts.max_buffer_size;
    let mut session = Session::<W>::new(parts);
    let Some(mut context) = session.start() else {
        session.retire(0);
        return session.exit();
    };

    let mut buffer = BatchBuffer::new(max_buffer_size, session.work_timeout(), Instant::now());

    loop {
        match session.control().lifecycle() {
            Lifecycle::Running => {}
            Lifecycle::Draining => {
                let Some(rest) = session.take::<W::Item>(usize::MAX, Some(Duration::ZERO)).await
                else {
                    break;
                };
                buffer.extend(rest);
                let items = buffer.take(Instant::now());
                tracing::debug!(
                    worker = %session.worker(),
                    items = items.len(),
                    "queue end reached; final work call"
                );
                flush(&mut session, &mut context, items);
                break;
            }
            _ => break,
        }

        let now = Instant::now();
        if buffer.should_flush(now) {
            let items = buffer.take(now);
            if !flush(&mut session, &mut context, items) {
                break;
            }
            continue;
        }

        let wait = buffer.remaining(now);
        match session.take::<W::Item>(buffer.room(), wait).await {
            Some(items) => buffer.extend(items),
            None => break,
        }
    }

    session.retire(buffer.len());
    session.finish(&mut context);
    session.exit()
}

/// Calls `work` with `items` and sends the output upstream. Returns `false`
/// when the run must end.
fn flush<W: Consume>(session: &mut Session<W>, context: &mut W::Context, items: Vec<W::Item>) -> bool {
    tracing::trace!(worker = %session.worker(), items = items.len(), "invoking work");
    match session.work(|state, pipe, args| W::work(items, context, state, pipe, args)) {
        Some(output) => session.publish(&output),
        None => false,
    }
}

/// Takes up to `limit` items for the worker process, waiting at most `wait`
/// for the first one. A stop request ends the wait with nothing.
async fn take_items<T: Serialize>(
    scope: &RelayScope,
    queue: &WorkQueue<T>,
    limit: usize,
    wait: Option<Duration>,
) -> Vec<Value> {
    if limit == 0 {
        return Vec::new();
    }

    let first = match wait {
        Some(wait) if wait.is_zero() => queue.try_pop().await,
        _ => tokio::select! {
            biased;
            _ = scope.signal().cancelled() => None,
            item = next_item(queue, wait) => item,
        },
    };

    let mut items = Vec::new();
    if let Some(first) = first {
        items.push(first);
        queue.drain_into(&mut items, limit - 1).await;
    }

    let mut encoded = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::to_value(&item) {
            Ok(value) => encoded.push(value),
            Err(err) => {
                scope.telemetry.record_items_discarded(1);
                tracing::warn!(worker = %scope.worker, error = %err, "dropping a queued item that cannot be encoded");
            }
        }
    }
    encoded
}

async fn next_item<T>(queue: &WorkQueue<T>, wait: Option<Duration>) -> Option<T> {
    match wait {
        Some(wait) => queue.pop_timeout(wait).await,
        None => Some(queue.pop().await),
    }
}

/// Marks the queue not ready and empties it. `buffered` items left in the
/// run's buffer are counted as discarded alongside the cleared ones.
async fn retire<T>(scope: &RelayScope, queue: &WorkQueue<T>, buffered: usize) {
    let cleared = queue.retire().await;
    let discarded = buffered + cleared;
    if discarded > 0 {
        scope.telemetry.record_items_discarded(discarded as u64);
        tracing::info!(
            worker = %scope.worker,
            buffered,
            queued = cleared,
            "consumer stopped with unprocessed items; discarded"
        );
    }
}
