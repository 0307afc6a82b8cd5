//! Controller side of a worker process.
//!
//! [`spawn_worker_process`] starts a [`HostCommand`] with piped stdin and
//! stdout. Two tasks then serve the run: one writes commands and controller
//! messages to the worker's stdin, the other reads its reports, brokers queue
//! access for it and feeds the monitors. Worker output that is not a frame is
//! passed through to the controller's stdout.

use crate::channel::{EndpointReceiver, EndpointSender};
use crate::runtime::config::HostCommand;
use crate::runtime::telemetry::Telemetry;
use crate::worker::callbacks::{CallbackError, CallbackStage};
use crate::worker::monitor::WorkerEvent;
use crate::worker::protocol::{decode, encode, write_frame, Command, Frame, Payload, Report};
use crate::worker::state::{Lifecycle, RunControl};
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Set in the environment of every worker process; holds the worker's name.
pub(crate) const WORKER_ENV: &str = "PRODCON_WORKER";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// What the relay knows about the run it serves.
pub(crate) struct RelayScope {
    pub worker: Arc<str>,
    pub control: Arc<RunControl>,
    pub telemetry: Arc<Telemetry>,
}

impl RelayScope {
    pub(crate) fn signal(&self) -> &CancellationToken {
        self.control.signal()
    }
}

/// Controller-side queue access a worker process asks for over its pipe.
pub(crate) trait QueueSide<O: Send + 'static>: Send + Sync + 'static {
    /// Pushes a producer output into the subscribed queues and hands it back.
    fn deliver<'a>(&'a self, output: O, _scope: &'a RelayScope) -> BoxFuture<'a, O> {
        Box::pin(async move { output })
    }

    /// Takes up to `limit` queued items, waiting at most `wait` for the first.
    fn take<'a>(
        &'a self,
        _limit: usize,
        _wait: Option<Duration>,
        _scope: &'a RelayScope,
    ) -> BoxFuture<'a, Vec<Value>> {
        Box::pin(async { Vec::new() })
    }

    /// Called once when the run is over; `buffered` items never reached `work`.
    fn retire<'a>(&'a self, _buffered: usize, _scope: &'a RelayScope) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

pub(crate) struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

pub(crate) fn spawn_worker_process(host: &HostCommand, worker: &str) -> Result<WorkerProcess> {
    let mut command = host.command()?;
    command
        .env(WORKER_ENV, worker)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn the process of worker `{worker}`"))?;
    let stdin = child
        .stdin
        .take()
        .context("worker process stdin was not captured")?;
    let stdout = child
        .stdout
        .take()
        .context("worker process stdout was not captured")?;

    tracing::debug!(worker, pid = ?child.id(), "worker process spawned");
    Ok(WorkerProcess {
        child,
        stdin,
        stdout,
    })
}

pub(crate) struct RelayParams<O, M, Q> {
    pub scope: RelayScope,
    pub forward_results: bool,
    pub queues: Q,
    pub events: EndpointSender<WorkerEvent<O>>,
    pub messages: EndpointSender<M>,
    pub commands: UnboundedSender<Command>,
}

/// Turns reports of one worker process into queue operations, monitor
/// events and command replies.
pub(crate) struct Relay<O, M, Q> {
    scope: RelayScope,
    forward_results: bool,
    queues: Q,
    events: EndpointSender<WorkerEvent<O>>,
    messages: EndpointSender<M>,
    commands: UnboundedSender<Command>,
    done: CancellationToken,
    exited: bool,
    retired: bool,
}

impl<O, M, Q> Relay<O, M, Q>
where
    O: Payload,
    M: Payload,
    Q: QueueSide<O>,
{
    pub(crate) fn new(params: RelayParams<O, M, Q>, done: CancellationToken) -> Self {
        let RelayParams {
            scope,
            forward_results,
            queues,
            events,
            messages,
            commands,
        } = params;
        Self {
            scope,
            forward_results,
            queues,
            events,
            messages,
            commands,
            done,
            exited: false,
            retired: false,
        }
    }

    /// Handles frames until the worker's stdout closes.
    pub(crate) async fn pump<R: AsyncBufRead + Unpin>(&mut self, lines: &mut Lines<R>) {
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(worker = %self.scope.worker, error = %err, "failed to read from the worker process");
                    break;
                }
            };

            match Report::from_line(&line) {
                Ok(report) => self.handle(report).await,
                Err(_) if self.exited => {
                    tracing::debug!(worker = %self.scope.worker, line = %line, "worker process output after its exit report")
                }
                Err(_) => println!("{line}"),
            }
        }
    }

    async fn handle(&mut self, report: Report) {
        match report {
            Report::Ready => {
                tracing::debug!(worker = %self.scope.worker, "repeated handshake ignored")
            }
            Report::Message { payload } => match decode::<M>(payload) {
                Ok(message) => {
                    if self.messages.send(message).is_err() {
                        tracing::debug!(worker = %self.scope.worker, "message monitor gone; dropping message");
                    }
                }
                Err(err) => {
                    tracing::warn!(worker = %self.scope.worker, error = %err, "dropping a message the controller cannot decode")
                }
            },
            Report::Produced { payload } => {
                self.scope.telemetry.record_work_call();
                match decode::<O>(payload) {
                    Ok(output) => {
                        let output = self.queues.deliver(output, &self.scope).await;
                        self.forward(output);
                    }
                    Err(err) => {
                        tracing::warn!(worker = %self.scope.worker, error = %err, "dropping an output the controller cannot decode")
                    }
                }
                let _ = self.commands.send(Command::Pushed);
            }
            Report::Result { payload } => {
                self.scope.telemetry.record_work_call();
                if !self.forward_results {
                    return;
                }
                match decode::<O>(payload) {
                    Ok(output) => self.forward(output),
                    Err(err) => {
                        tracing::warn!(worker = %self.scope.worker, error = %err, "dropping a result the controller cannot decode")
                    }
                }
            }
            Report::Take { limit, wait } => {
                let items = self.queues.take(limit, wait, &self.scope).await;
                let _ = self.commands.send(Command::Items { items });
            }
            Report::Failed { stage, error } => {
                if stage == CallbackStage::Work {
                    self.scope.telemetry.record_work_call();
                }
                self.scope.telemetry.record_failure();
                let error = CallbackError::new(self.scope.worker.to_string(), stage, anyhow!(error));
                if let Err(unsent) = self.events.send(WorkerEvent::Failed(error)) {
                    tracing::error!(worker = %self.scope.worker, error = %unsent, "could not report callback failure");
                }
            }
            Report::Requested { lifecycle } => {
                let changed = match lifecycle {
                    Lifecycle::Stopping => self.scope.control.request_stop(),
                    Lifecycle::Draining => self.scope.control.request_drain(),
                    _ => false,
                };
                if changed {
                    tracing::info!(worker = %self.scope.worker, lifecycle = %lifecycle, "run asked to end from a callback");
                }
            }
            Report::Retired { buffered } => self.retire(buffered).await,
            Report::Exited { exit } => {
                self.exited = true;
                self.scope.control.mark_terminated();
                let _ = self.events.send(WorkerEvent::Exited(exit));
                self.done.cancel();
            }
        }
    }

    fn forward(&self, output: O) {
        if !self.forward_results {
            return;
        }
        if self.events.send(WorkerEvent::Result(output)).is_ok() {
            self.scope.telemetry.record_result_forwarded();
        } else {
            tracing::debug!(worker = %self.scope.worker, "result channel closed; dropping result");
        }
    }

    async fn retire(&mut self, buffered: usize) {
        if self.retired {
            return;
        }
        self.retired = true;
        self.queues.retire(buffered, &self.scope).await;
    }

    /// Retires the queue side if the worker never did, e.g. after a crash.
    pub(crate) async fn finish(&mut self) {
        self.retire(0).await;
    }

    pub(crate) fn exited(&self) -> bool {
        self.exited
    }
}

/// Skips output printed before the worker's first frame, e.g. a test
/// harness banner, until the handshake arrives.
pub(crate) async fn await_ready<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>) -> Result<()> {
    while let Some(line) = lines.next_line().await? {
        match Report::from_line(&line) {
            Ok(Report::Ready) => return Ok(()),
            Ok(other) => bail!("expected a handshake, got {other:?}"),
            Err(_) => tracing::debug!(line = %line, "skipping worker output before the handshake"),
        }
    }
    bail!("worker process closed its output before the handshake")
}

async fn feed_commands<W, M>(
    worker: Arc<str>,
    mut stdin: W,
    mut commands: UnboundedReceiver<Command>,
    mut messages: EndpointReceiver<M>,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    loop {
        let command = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            Some(command) = commands.recv() => command,
            Some(message) = messages.recv() => match encode(&message) {
                Ok(payload) => Command::Message { payload },
                Err(err) => {
                    tracing::error!(worker = %worker, error = %err, "dropping a message that cannot be encoded");
                    continue;
                }
            },
        };

        if let Err(err) = write_frame(&mut stdin, &command).await {
            tracing::debug!(worker = %worker, error = %err, "worker process stopped reading commands");
            break;
        }
    }
}

async fn supervise<O, M, Q>(mut relay: Relay<O, M, Q>, mut child: Child, stdout: ChildStdout)
where
    O: Payload,
    M: Payload,
    Q: QueueSide<O>,
{
    let worker = relay.scope.worker.clone();
    let mut lines = BufReader::new(stdout).lines();
    match timeout(HANDSHAKE_TIMEOUT, await_ready(&mut lines)).await {
        Ok(Ok(())) => relay.pump(&mut lines).await,
        Ok(Err(err)) => tracing::error!(
            worker = %worker,
            error = %format!("{err:#}"),
            "worker process failed the handshake; does its main call WorkerHost::serve_if_requested first?"
        ),
        Err(_) => tracing::error!(
            worker = %worker,
            "worker process did not complete the handshake within {HANDSHAKE_TIMEOUT:?}"
        ),
    }

    relay.finish().await;
    relay.done.cancel();

    match timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) if relay.exited() => {
            tracing::debug!(worker = %worker, %status, "worker process exited")
        }
        Ok(Ok(status)) => {
            tracing::error!(worker = %worker, %status, "worker process ended without reporting an exit")
        }
        Ok(Err(err)) => tracing::warn!(worker = %worker, error = %err, "failed to wait for the worker process"),
        Err(_) => {
            tracing::warn!(worker = %worker, "worker process still alive after its run ended; killing it");
            if let Err(err) = child.kill().await {
                tracing::warn!(worker = %worker, error = %err, "failed to kill the worker process");
            }
        }
    }
}

/// The two relay tasks of one run.
#[derive(Default)]
pub(crate) struct RelayHandles {
    reports: Option<JoinHandle<()>>,
    commands: Option<JoinHandle<()>>,
}

impl RelayHandles {
    pub(crate) fn spawn<O, M, Q>(
        runtime: &Handle,
        process: WorkerProcess,
        params: RelayParams<O, M, Q>,
        commands: UnboundedReceiver<Command>,
        messages: EndpointReceiver<M>,
    ) -> Self
    where
        O: Payload,
        M: Payload,
        Q: QueueSide<O>,
    {
        let WorkerProcess {
            child,
            stdin,
            stdout,
        } = process;
        let done = CancellationToken::new();
        let worker = params.scope.worker.clone();
        let relay = Relay::new(params, done.clone());

        Self {
            commands: Some(runtime.spawn(feed_commands(worker, stdin, commands, messages, done))),
            reports: Some(runtime.spawn(supervise(relay, child, stdout))),
        }
    }

    pub(crate) async fn join(&mut self) {
        for handle in [self.reports.take(), self.commands.take()].into_iter().flatten() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "relay task ended abnormally");
            }
        }
    }
}
