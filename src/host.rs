//! Entry point of worker processes.
//!
//! Every run executes in a child process started from a
//! [`HostCommand`](crate::HostCommand), by default the controller's own
//! executable. That process has to recognise it was started as a worker and
//! serve the run instead of running the application, so `main` begins by
//! handing control to a [`WorkerHost`] that knows every worker type:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     if WorkerHost::new()
//!         .producer::<Count>()
//!         .consumer::<Describe>()
//!         .serve_if_requested()
//!         .await?
//!     {
//!         return Ok(());
//!     }
//!     // controller code
//! }
//! ```

use crate::consumer::{run_consumer, Consume};
use crate::producer::{run_producer, Produce};
use crate::worker::{
    host_run, spawn_command_reader, write_frame, CallbackStage, Command, Launch, Report, Role,
    WorkerExit, WORKER_ENV,
};
use anyhow::{bail, Result};
use futures::future::{FutureExt, LocalBoxFuture};
use std::collections::HashMap;
use tokio::io::Stdout;
use tokio::sync::mpsc::UnboundedReceiver;

type Entry = fn(Launch, UnboundedReceiver<Command>, Stdout) -> LocalBoxFuture<'static, Result<()>>;

/// Registry of the worker types this executable can run in a worker process.
#[derive(Default)]
pub struct WorkerHost {
    entries: HashMap<(Role, String), Entry>,
}

impl WorkerHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer<W: Produce>(mut self) -> Self {
        self.entries
            .insert((Role::Producer, kind_of::<W>().to_string()), serve_producer::<W>);
        self
    }

    pub fn consumer<W: Consume>(mut self) -> Self {
        self.entries
            .insert((Role::Consumer, kind_of::<W>().to_string()), serve_consumer::<W>);
        self
    }

    /// Whether this process was started to host a worker run.
    pub fn is_worker_process() -> bool {
        std::env::var_os(WORKER_ENV).is_some()
    }

    /// Serves the run this process was started for and returns `true`. In a
    /// process that is not a worker process, returns `false` right away.
    pub async fn serve_if_requested(self) -> Result<bool> {
        if !Self::is_worker_process() {
            return Ok(false);
        }
        self.serve().await?;
        Ok(true)
    }

    async fn serve(self) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        write_frame(&mut stdout, &Report::Ready).await?;

        let mut commands = spawn_command_reader()?;
        let launch = match commands.recv().await {
            Some(Command::Launch(launch)) => launch,
            Some(other) => bail!("expected a launch command, got {other:?}"),
            None => bail!("controller closed the command pipe before launching a run"),
        };
        tracing::debug!(
            worker = %launch.worker,
            role = %launch.role,
            kind = %launch.kind,
            "serving a worker run"
        );

        match self.entries.get(&(launch.role, launch.kind.clone())) {
            Some(entry) => entry(launch, commands, stdout).await,
            None => refuse(launch, stdout).await,
        }
    }

    /// Registered worker types, as `(role, type name)` pairs.
    pub fn registered(&self) -> Vec<(String, String)> {
        let mut kinds = self
            .entries
            .keys()
            .map(|(role, kind)| (role.to_string(), kind.clone()))
            .collect::<Vec<_>>();
        kinds.sort();
        kinds
    }
}

/// Type name identifying a worker type on both sides of the pipe.
pub(crate) fn kind_of<W: ?Sized>() -> &'static str {
    std::any::type_name::<W>()
}

fn serve_producer<W: Produce>(
    launch: Launch,
    commands: UnboundedReceiver<Command>,
    stdout: Stdout,
) -> LocalBoxFuture<'static, Result<()>> {
    host_run(launch, commands, stdout, run_producer::<W>).boxed_local()
}

fn serve_consumer<W: Consume>(
    launch: Launch,
    commands: UnboundedReceiver<Command>,
    stdout: Stdout,
) -> LocalBoxFuture<'static, Result<()>> {
    host_run(launch, commands, stdout, run_consumer::<W>).boxed_local()
}

/// Answers a launch of an unknown worker type with a failed start.
async fn refuse(launch: Launch, mut stdout: Stdout) -> Result<()> {
    let error = format!(
        "{} `{}` is not registered with the WorkerHost of this executable",
        launch.role, launch.kind
    );
    tracing::error!(worker = %launch.worker, "{error}");
    write_frame(
        &mut stdout,
        &Report::Failed {
            stage: CallbackStage::Start,
            error,
        },
    )
    .await?;
    write_frame(
        &mut stdout,
        &Report::Exited {
            exit: WorkerExit::Failed(CallbackStage::Start),
        },
    )
    .await
}
