//! Worker lifecycle shared by producers and consumers.
//!
//! A worker handle lives on the controller. Each `start_new` creates a fresh
//! run: a child process executing the callbacks, a message channel pair and a
//! result channel pair fed by the relay reading the child's output, and two
//! monitor tasks on the controller runtime.

mod args;
mod callbacks;
mod failure;
mod monitor;
mod process;
mod protocol;
mod session;
mod state;

pub use args::WorkArgs;
pub use callbacks::{CallbackError, CallbackStage, WorkerCallbacks};
pub use monitor::{WorkerEvent, WorkerExit, WorkerHooks};
pub use protocol::Payload;
pub use state::{Lifecycle, RunState};

pub(crate) use process::{QueueSide, RelayScope, WORKER_ENV};
pub(crate) use protocol::{write_frame, Command, Launch, Report, Role};
pub(crate) use session::{host_run, pause_until, spawn_command_reader, RunParts, Session};
pub(crate) use state::RunControl;

use crate::channel::{channel_pair, MessageSender};
use crate::runtime::config::WorkerConfig;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, bail, Context, Result};
use failure::FailureRecorder;
use monitor::{MonitorHandles, MonitorParams};
use process::{spawn_worker_process, RelayHandles, RelayParams};
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};

/// Controller-side state shared by [`crate::Producer`] and [`crate::Consumer`].
pub(crate) struct WorkerCore<O, M, H> {
    config: WorkerConfig,
    hooks: Arc<H>,
    telemetry: Arc<Telemetry>,
    run: Option<ActiveRun<M>>,
    _output: PhantomData<fn() -> O>,
}

struct ActiveRun<M> {
    control: Arc<RunControl>,
    messages: MessageSender<M>,
    commands: UnboundedSender<Command>,
    relay: RelayHandles,
    monitors: MonitorHandles,
    failures: FailureRecorder,
}

impl<M> ActiveRun<M> {
    /// Queues `command` for the worker process, then applies `transition` to
    /// the controller's lifecycle. The command goes first so the worker sees
    /// it before any reply the transition unblocks.
    fn request(&self, command: Command, transition: fn(&RunControl) -> bool) -> bool {
        if !self.control.lifecycle().is_active() {
            return false;
        }
        let _ = self.commands.send(command);
        transition(&self.control)
    }
}

impl<O, M, H> WorkerCore<O, M, H>
where
    O: Payload,
    M: Payload,
    H: WorkerHooks<O, M>,
{
    pub(crate) fn new(config: WorkerConfig, hooks: H) -> Self {
        Self {
            config,
            hooks: Arc::new(hooks),
            telemetry: Arc::new(Telemetry::default()),
            run: None,
            _output: PhantomData,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.config.name()
    }

    pub(crate) fn hooks(&self) -> &H {
        &self.hooks
    }

    pub(crate) fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub(crate) fn set_telemetry(&mut self, telemetry: Arc<Telemetry>) {
        self.telemetry = telemetry;
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.run
            .as_ref()
            .map(|run| run.control.lifecycle())
            .unwrap_or(Lifecycle::Idle)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lifecycle().is_active()
    }

    /// Starts a new run of the `kind` callbacks in a worker process, with
    /// `queues` answering its queue requests.
    ///
    /// Fails while a previous run is still active, inside a worker process,
    /// outside a tokio runtime (the relay and monitors need one) or when the
    /// process cannot be spawned.
    pub(crate) fn launch<Q>(
        &mut self,
        role: Role,
        kind: &str,
        call_args: &WorkArgs,
        max_buffer_size: usize,
        queues: Q,
    ) -> Result<()>
    where
        Q: QueueSide<O>,
    {
        let lifecycle = self.lifecycle();
        if lifecycle.is_active() {
            bail!(
                "worker `{}` is {lifecycle}; wait for the current run to terminate before starting a new one",
                self.name()
            );
        }
        if crate::host::WorkerHost::is_worker_process() {
            bail!(
                "worker `{}` cannot be started from inside a worker process",
                self.name()
            );
        }

        let runtime = Handle::try_current()
            .map_err(|_| anyhow!("start_new must be called from within a tokio runtime"))?;
        self.release_unjoined_failure();

        let worker: Arc<str> = Arc::from(self.name());
        let process = spawn_worker_process(self.config.host(), &worker)
            .with_context(|| format!("failed to start worker `{worker}`"))?;

        let control = Arc::new(RunControl::new());
        let failures = FailureRecorder::new();
        let (message_parent, message_child) = channel_pair::<M, M>();
        let (result_parent, result_child) = channel_pair::<Infallible, WorkerEvent<O>>();
        let (messages, message_rx) = message_parent.split();
        let (from_worker, to_worker) = message_child.split();
        let (_, events_rx) = result_parent.split();
        let (events, _) = result_child.split();

        let (commands, command_rx) = mpsc::unbounded_channel();
        commands
            .send(Command::Launch(Launch {
                worker: worker.to_string(),
                role,
                kind: kind.to_string(),
                args: self.config.work_args().merged(call_args),
                work_timeout: self.config.work_timeout(),
                max_buffer_size,
            }))
            .map_err(|_| anyhow!("command feed of worker `{worker}` closed before launch"))?;

        let relay = RelayHandles::spawn(
            &runtime,
            process,
            RelayParams {
                scope: RelayScope {
                    worker: worker.clone(),
                    control: control.clone(),
                    telemetry: self.telemetry.clone(),
                },
                forward_results: self.config.forward_results(),
                queues,
                events,
                messages: from_worker,
                commands: commands.clone(),
            },
            command_rx,
            to_worker,
        );

        let monitors = MonitorHandles::spawn(
            &runtime,
            MonitorParams {
                worker: worker.clone(),
                hooks: self.hooks.clone(),
                telemetry: self.telemetry.clone(),
                control: control.clone(),
                failures: failures.clone(),
                events: events_rx,
                messages: message_rx,
            },
        );

        self.run = Some(ActiveRun {
            control,
            messages,
            commands,
            relay,
            monitors,
            failures,
        });

        tracing::info!(worker = %worker, role = %role, "worker run started");
        Ok(())
    }

    /// Logs the failure of a replaced run that was never joined.
    fn release_unjoined_failure(&mut self) {
        let Some(previous) = &self.run else {
            return;
        };
        if let Some(err) = previous.failures.take() {
            tracing::warn!(
                worker = %self.name(),
                error = %format!("{err:#}"),
                "previous run failed and was never joined; dropping its failure"
            );
        }
    }

    /// Requests the active run to stop. No-op when nothing is running.
    pub(crate) fn set_stopped(&self) {
        if let Some(run) = &self.run {
            if run.request(Command::Stop, RunControl::request_stop) {
                tracing::info!(worker = %self.name(), "stop requested");
            }
        }
    }

    pub(crate) fn set_draining(&self) {
        if let Some(run) = &self.run {
            if run.request(Command::Drain, RunControl::request_drain) {
                tracing::info!(worker = %self.name(), "stop at queue end requested");
            }
        }
    }

    pub(crate) fn send_message(&self, message: M) -> Result<()> {
        let run = self
            .run
            .as_ref()
            .with_context(|| format!("worker `{}` has never been started", self.name()))?;
        run.messages
            .send(message)
            .with_context(|| format!("worker `{}` run has ended; message not delivered", self.name()))
    }

    pub(crate) fn message_sender(&self) -> Option<MessageSender<M>> {
        self.run.as_ref().map(|run| run.messages.clone())
    }

    /// Waits for the current run's process, relay and monitors, then returns
    /// its first failure, if any. The failure is handed out once.
    pub(crate) async fn join(&mut self) -> Result<()> {
        let name = self.config.name().to_string();
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };

        run.relay.join().await;
        run.monitors.join().await;

        if run.failures.has_failed() {
            tracing::debug!(worker = %name, "joined a failed run");
        }
        match run.failures.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<O, M, H> Drop for WorkerCore<O, M, H> {
    fn drop(&mut self) {
        if let Some(run) = &self.run {
            if run.request(Command::Stop, RunControl::request_stop) {
                tracing::debug!(worker = %self.config.name(), "worker dropped; stop requested");
            }
        }
    }
}
