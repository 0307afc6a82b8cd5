//! The worker process side of a run.
//!
//! [`host_run`] connects the process's command stream and stdout to a
//! [`Session`]. Commands from the controller are dispatched to the run's
//! control cell, its message pipe or the request waiting for a reply, while
//! reports and outgoing messages are written back as frames. The run's loop,
//! given as `body`, drives the callbacks through the session. When the loop
//! returns, an exit report is the last frame written; a process that dies
//! before writing it is reported by the controller as an unexpected exit.

use crate::channel::{channel_pair, EndpointReceiver, EndpointSender, MessagePipe};
use crate::worker::args::WorkArgs;
use crate::worker::callbacks::{invoke, CallbackError, CallbackStage, WorkerCallbacks};
use crate::worker::monitor::WorkerExit;
use crate::worker::protocol::{decode, encode, write_frame, Command, Frame, Launch, Payload, Report};
use crate::worker::state::{Lifecycle, RunControl, RunState};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::io::BufRead;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::yield_now;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Controller answers to requests that wait for one.
#[derive(Debug)]
pub(crate) enum Reply {
    Pushed,
    Items(Vec<Value>),
}

/// The run's link to the controller: reports go out, replies come back in
/// the order the requests were made.
pub(crate) struct Uplink {
    reports: UnboundedSender<Report>,
    replies: UnboundedReceiver<Reply>,
}

impl Uplink {
    pub(crate) fn new(reports: UnboundedSender<Report>, replies: UnboundedReceiver<Reply>) -> Self {
        Self { reports, replies }
    }

    fn send(&self, report: Report) -> bool {
        self.reports.send(report).is_ok()
    }

    async fn request(&mut self, report: Report) -> Option<Reply> {
        if !self.send(report) {
            return None;
        }
        self.replies.recv().await
    }
}

/// Everything a run owns inside the worker process.
pub(crate) struct RunParts<M> {
    pub worker: Arc<str>,
    pub control: Arc<RunControl>,
    pub pipe: MessagePipe<M>,
    pub link: Uplink,
    pub args: WorkArgs,
    pub work_timeout: Duration,
    /// Consumers only.
    pub max_buffer_size: usize,
}

/// Reads commands from stdin on a dedicated thread, so a blocked read never
/// holds up the runtime. The thread ends with stdin or with the receiver.
pub(crate) fn spawn_command_reader() -> Result<UnboundedReceiver<Command>> {
    let (commands, receiver) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("prodcon-commands".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read from the controller");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::from_line(&line) {
                    Ok(command) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "ignoring malformed command"),
                }
            }
        })
        .context("failed to spawn the command reader thread")?;
    Ok(receiver)
}

/// Serves one launched run: dispatches `commands`, runs `body` and writes
/// every report to `out`, ending with the exit report.
pub(crate) async fn host_run<M, W, F, Fut>(
    launch: Launch,
    commands: UnboundedReceiver<Command>,
    out: W,
    body: F,
) -> Result<()>
where
    M: Payload,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(RunParts<M>) -> Fut,
    Fut: Future<Output = WorkerExit>,
{
    let Launch {
        worker,
        role,
        args,
        work_timeout,
        max_buffer_size,
        ..
    } = launch;
    let worker: Arc<str> = Arc::from(worker);
    let control = Arc::new(RunControl::new());
    let (controller_end, pipe) = channel_pair::<M, M>();
    let (inbox, outbox) = controller_end.split();
    let (reports, report_rx) = mpsc::unbounded_channel();
    let (replies, reply_rx) = mpsc::unbounded_channel();

    let dispatcher = tokio::spawn(dispatch_commands(commands, control.clone(), inbox, replies));
    let writer = tokio::spawn(write_reports(out, report_rx, outbox));

    tracing::debug!(worker = %worker, role = %role, "run starting in worker process");
    let exit = body(RunParts {
        worker: worker.clone(),
        control: control.clone(),
        pipe,
        link: Uplink::new(reports.clone(), reply_rx),
        args,
        work_timeout,
        max_buffer_size,
    })
    .await;

    control.mark_terminated();
    tracing::debug!(worker = %worker, exit = ?exit, "run finished in worker process");
    if reports.send(Report::Exited { exit }).is_err() {
        tracing::error!(worker = %worker, "report writer gone; exit not reported");
    }
    drop(reports);
    dispatcher.abort();
    writer.await.context("report writer task panicked")?
}

async fn dispatch_commands<M: Payload>(
    mut commands: UnboundedReceiver<Command>,
    control: Arc<RunControl>,
    inbox: EndpointSender<M>,
    replies: UnboundedSender<Reply>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Message { payload } => match decode::<M>(payload) {
                Ok(message) => {
                    let _ = inbox.send(message);
                }
                Err(err) => tracing::warn!(error = %err, "dropping a message the worker cannot decode"),
            },
            Command::Pushed => {
                let _ = replies.send(Reply::Pushed);
            }
            Command::Items { items } => {
                let _ = replies.send(Reply::Items(items));
            }
            Command::Stop => {
                control.request_stop();
            }
            Command::Drain => {
                control.request_drain();
            }
            Command::Launch(launch) => {
                tracing::warn!(worker = %launch.worker, "ignoring a second launch command");
            }
        }
    }
    tracing::debug!("controller closed the command pipe; stopping");
    control.request_stop();
}

/// Writes reports and outgoing messages until the exit report. Messages
/// already queued go out first, so nothing sent by `on_stop` trails the exit.
async fn write_reports<W, M>(
    mut out: W,
    mut reports: UnboundedReceiver<Report>,
    mut outbox: EndpointReceiver<M>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    loop {
        let report = tokio::select! {
            biased;
            Some(message) = outbox.recv() => match encode(&message) {
                Ok(payload) => Report::Message { payload },
                Err(err) => {
                    tracing::error!(error = %err, "dropping a message that cannot be encoded");
                    continue;
                }
            },
            report = reports.recv() => match report {
                Some(report) => report,
                None => break,
            },
        };

        let last = matches!(report, Report::Exited { .. });
        write_frame(&mut out, &report).await?;
        if last {
            break;
        }
    }
    Ok(())
}

/// Callback plumbing for one run: invokes callbacks with the run's state,
/// pipe and arguments and reports failures, outputs and requests upstream.
pub(crate) struct Session<W: WorkerCallbacks> {
    worker: Arc<str>,
    control: Arc<RunControl>,
    pipe: MessagePipe<W::Message>,
    link: Uplink,
    args: WorkArgs,
    work_timeout: Duration,
    state: RunState<W::State>,
    failed: Option<CallbackStage>,
    _callbacks: PhantomData<fn() -> W>,
}

impl<W: WorkerCallbacks> Session<W> {
    pub(crate) fn new(parts: RunParts<W::Message>) -> Self {
        let RunParts {
            worker,
            control,
            pipe,
            link,
            args,
            work_timeout,
            ..
        } = parts;
        let state = RunState::new(W::State::default(), worker.clone(), control.clone());

        Self {
            worker,
            control,
            pipe,
            link,
            args,
            work_timeout,
            state,
            failed: None,
            _callbacks: PhantomData,
        }
    }

    pub(crate) fn worker(&self) -> &str {
        &self.worker
    }

    pub(crate) fn control(&self) -> &RunControl {
        &self.control
    }

    pub(crate) fn signal(&self) -> &CancellationToken {
        self.control.signal()
    }

    pub(crate) fn work_timeout(&self) -> Duration {
        self.work_timeout
    }

    /// Runs `on_start`. `None` means it failed and the run must end without
    /// calling `work` or `on_stop`.
    pub(crate) fn start(&mut self) -> Option<W::Context> {
        tracing::debug!(worker = %self.worker, "invoking on_start");
        let before = self.control.lifecycle();
        let result = invoke(&self.worker, CallbackStage::Start, || {
            W::on_start(&mut self.state, &mut self.pipe, &self.args)
        });
        self.forward_request(before);
        self.settle(result)
    }

    /// Runs `work` through `call`, which receives the run's state, pipe and
    /// arguments. `None` means the call failed.
    pub(crate) fn work<T>(
        &mut self,
        call: impl FnOnce(&mut RunState<W::State>, &mut MessagePipe<W::Message>, &WorkArgs) -> Result<T>,
    ) -> Option<T> {
        let before = self.control.lifecycle();
        let result = invoke(&self.worker, CallbackStage::Work, || {
            call(&mut self.state, &mut self.pipe, &self.args)
        });
        self.forward_request(before);
        self.settle(result)
    }

    pub(crate) fn finish(&mut self, context: &mut W::Context) {
        tracing::debug!(worker = %self.worker, "invoking on_stop");
        let result = invoke(&self.worker, CallbackStage::Stop, || {
            W::on_stop(context, &mut self.state, &mut self.pipe, &self.args)
        });
        self.settle(result);
    }

    /// Sends a consumer output to the controller. `false` when it could not
    /// be encoded, which fails the run.
    pub(crate) fn publish<O: Serialize>(&mut self, output: &O) -> bool {
        match encode(output) {
            Ok(payload) => {
                if !self.link.send(Report::Result { payload }) {
                    tracing::debug!(worker = %self.worker, "controller link closed; dropping result");
                }
                true
            }
            Err(err) => {
                self.codec_failed(anyhow::Error::new(err).context("work output cannot be encoded"));
                false
            }
        }
    }

    /// Hands a producer output to the controller and waits until it reached
    /// the subscribed queues. `false` when the run must end.
    pub(crate) async fn produce<O: Serialize>(&mut self, output: &O) -> bool {
        let payload = match encode(output) {
            Ok(payload) => payload,
            Err(err) => {
                self.codec_failed(anyhow::Error::new(err).context("work output cannot be encoded"));
                return false;
            }
        };

        match self.link.request(Report::Produced { payload }).await {
            Some(Reply::Pushed) => true,
            Some(other) => {
                tracing::warn!(worker = %self.worker, reply = ?other, "unexpected reply to a produced value");
                true
            }
            None => {
                tracing::debug!(worker = %self.worker, "controller link closed");
                false
            }
        }
    }

    /// Asks the controller for up to `limit` queued items, waiting at most
    /// `wait` for the first. `None` when the run must end.
    pub(crate) async fn take<I: DeserializeOwned>(
        &mut self,
        limit: usize,
        wait: Option<Duration>,
    ) -> Option<Vec<I>> {
        let items = match self.link.request(Report::Take { limit, wait }).await {
            Some(Reply::Items(items)) => items,
            Some(other) => {
                tracing::warn!(worker = %self.worker, reply = ?other, "unexpected reply to a take");
                Vec::new()
            }
            None => {
                tracing::debug!(worker = %self.worker, "controller link closed");
                return None;
            }
        };

        match items.into_iter().map(decode).collect::<serde_json::Result<Vec<I>>>() {
            Ok(items) => Some(items),
            Err(err) => {
                self.codec_failed(anyhow::Error::new(err).context("queued item cannot be decoded"));
                None
            }
        }
    }

    /// Tells the controller the consumer loop is over; `buffered` items were
    /// never handed to `work`.
    pub(crate) fn retire(&self, buffered: usize) {
        self.link.send(Report::Retired { buffered });
    }

    pub(crate) fn exit(self) -> WorkerExit {
        match self.failed {
            Some(stage) => WorkerExit::Failed(stage),
            None => WorkerExit::Completed,
        }
    }

    /// Mirrors a stop or drain asked for from inside a callback to the
    /// controller's copy of the lifecycle.
    fn forward_request(&self, before: Lifecycle) {
        let now = self.control.lifecycle();
        if now != before && matches!(now, Lifecycle::Stopping | Lifecycle::Draining) {
            self.link.send(Report::Requested { lifecycle: now });
        }
    }

    fn codec_failed(&mut self, error: anyhow::Error) {
        self.report(CallbackError::new(self.worker.to_string(), CallbackStage::Work, error));
    }

    fn settle<T>(&mut self, result: Result<T, CallbackError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.report(err);
                None
            }
        }
    }

    fn report(&mut self, error: CallbackError) {
        let stage = error.stage();
        if self.failed.is_none() {
            self.failed = Some(stage);
        }
        tracing::warn!(worker = %self.worker, stage = %stage, error = %error, "callback failed; ending run");
        let error = format!("{:#}", error.into_source());
        if !self.link.send(Report::Failed { stage, error }) {
            tracing::error!(worker = %self.worker, "could not report callback failure");
        }
    }
}

/// Waits until `deadline`, returning early once `signal` is cancelled. A
/// deadline already in the past only yields to the runtime.
pub(crate) async fn pause_until(deadline: Instant, signal: &CancellationToken) {
    if deadline <= Instant::now() {
        yield_now().await;
        return;
    }

    tokio::select! {
        _ = signal.cancelled() => {}
        _ = sleep_until(deadline) => {}
    }
}
