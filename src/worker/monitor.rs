//! Controller-side monitor tasks of a worker run.
//!
//! Each run gets two tasks on the controller runtime: one delivers messages
//! from the worker process, the other delivers results, callback failures and
//! the final exit report. Both end when the relay reading the worker's output
//! drops its end of the channel, which happens once the process has exited.

use crate::channel::EndpointReceiver;
use crate::runtime::telemetry::Telemetry;
use crate::worker::callbacks::{CallbackError, CallbackStage};
use crate::worker::failure::FailureRecorder;
use crate::worker::state::RunControl;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Events travelling from a run to the controller over the result channel.
#[derive(Debug)]
pub enum WorkerEvent<O> {
    Result(O),
    Failed(CallbackError),
    Exited(WorkerExit),
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    Completed,
    /// A callback failed in the given stage; `on_stop` still ran unless the
    /// failure was in `on_start` or `on_stop` itself.
    Failed(CallbackStage),
    /// The worker process went away without reporting an exit.
    Unexpected,
}

/// Controller-side reactions to a worker's output. Invoked from the monitor
/// tasks, in the order the run produced the events.
///
/// Every method defaults to doing nothing; failures and unexpected exits are
/// logged by the monitors whether or not they are overridden.
pub trait WorkerHooks<O, M>: Send + Sync + 'static {
    fn on_result_ready(&self, _result: O) {}

    fn on_message_ready(&self, _message: M) {}

    fn on_error(&self, _error: &CallbackError) {}

    fn on_exit(&self, _exit: &WorkerExit) {}
}

impl<O, M> WorkerHooks<O, M> for () {}

pub(crate) struct MonitorParams<O, M, H> {
    pub worker: Arc<str>,
    pub hooks: Arc<H>,
    pub telemetry: Arc<Telemetry>,
    pub control: Arc<RunControl>,
    pub failures: FailureRecorder,
    pub events: EndpointReceiver<WorkerEvent<O>>,
    pub messages: EndpointReceiver<M>,
}

#[derive(Default)]
pub(crate) struct MonitorHandles {
    results: Option<JoinHandle<()>>,
    messages: Option<JoinHandle<()>>,
}

impl MonitorHandles {
    pub(crate) fn spawn<O, M, H>(runtime: &Handle, params: MonitorParams<O, M, H>) -> Self
    where
        O: Send + 'static,
        M: Send + 'static,
        H: WorkerHooks<O, M>,
    {
        let MonitorParams {
            worker,
            hooks,
            telemetry,
            control,
            failures,
            events,
            messages,
        } = params;

        let messages = runtime.spawn(watch_messages::<O, M, H>(
            worker.clone(),
            hooks.clone(),
            telemetry.clone(),
            messages,
        ));
        let results = runtime.spawn(watch_results::<O, M, H>(
            worker, hooks, telemetry, control, failures, events,
        ));

        Self {
            results: Some(results),
            messages: Some(messages),
        }
    }

    /// Waits for both monitors. Safe to call more than once.
    pub(crate) async fn join(&mut self) {
        if let Some(handle) = self.results.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "result monitor task panicked");
            }
        }

        if let Some(handle) = self.messages.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "message monitor task panicked");
            }
        }
    }
}

async fn watch_messages<O, M, H>(
    worker: Arc<str>,
    hooks: Arc<H>,
    telemetry: Arc<Telemetry>,
    mut messages: EndpointReceiver<M>,
) where
    H: WorkerHooks<O, M>,
{
    while let Some(message) = messages.recv().await {
        telemetry.record_message_delivered();
        hooks.on_message_ready(message);
    }
    tracing::trace!(worker = %worker, "message channel closed");
}

async fn watch_results<O, M, H>(
    worker: Arc<str>,
    hooks: Arc<H>,
    telemetry: Arc<Telemetry>,
    control: Arc<RunControl>,
    failures: FailureRecorder,
    mut events: EndpointReceiver<WorkerEvent<O>>,
) where
    H: WorkerHooks<O, M>,
{
    let mut reported_exit = None;

    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Result(result) => {
                telemetry.record_result_delivered();
                hooks.on_result_ready(result);
            }
            WorkerEvent::Failed(error) => {
                tracing::error!(
                    worker = %worker,
                    stage = %error.stage(),
                    error = %error,
                    "worker callback failed"
                );
                hooks.on_error(&error);
                failures.record(error.into());
            }
            WorkerEvent::Exited(exit) => {
                reported_exit = Some(exit);
            }
        }
    }

    let exit = match reported_exit {
        Some(exit) => {
            tracing::info!(worker = %worker, exit = ?exit, "worker run terminated");
            exit
        }
        None => {
            control.mark_terminated();
            tracing::error!(
                worker = %worker,
                "worker process ended without an exit report; worker terminated unexpectedly"
            );
            failures.record(anyhow!("worker `{worker}` terminated unexpectedly"));
            WorkerExit::Unexpected
        }
    };

    hooks.on_exit(&exit);
}
