use crate::worker::WorkArgs;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_BUFFER_SIZE: usize = 1;

/// How worker processes are started: a program, by default the running
/// executable, and the arguments passed to it.
///
/// The program must hand control to [`crate::WorkerHost::serve_if_requested`]
/// early in `main`, with every worker type it may be asked to run registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCommand {
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl HostCommand {
    /// Re-runs the current executable.
    pub fn current_exe() -> Self {
        Self::default()
    }

    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn command(&self) -> Result<tokio::process::Command> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().context("failed to locate the current executable")?,
        };
        let mut command = tokio::process::Command::new(program);
        command.args(&self.args);
        Ok(command)
    }
}

/// Options shared by every worker.
///
/// All instances must be constructed via [`WorkerConfig::builder`] or [`WorkerConfig::new`]
/// so invariants are validated before a worker observes the values.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    name: String,
    work_timeout: Duration,
    work_args: WorkArgs,
    forward_results: bool,
    host: HostCommand,
}

pub struct WorkerConfigParams {
    pub name: String,
    pub work_timeout: Duration,
    pub work_args: WorkArgs,
    pub forward_results: bool,
    pub host: HostCommand,
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    pub fn new(params: WorkerConfigParams) -> Result<Self> {
        let WorkerConfigParams {
            name,
            work_timeout,
            work_args,
            forward_results,
            host,
        } = params;

        let config = Self {
            name: name.trim().to_owned(),
            work_timeout,
            work_args,
            forward_results,
            host,
        };

        config.validate()?;
        Ok(config)
    }

    /// Identity used in logs and telemetry, and passed to the worker process.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minimum time between two `work` calls.
    pub fn work_timeout(&self) -> Duration {
        self.work_timeout
    }

    /// Arguments fixed at construction; merged with the ones passed to `start_new`.
    pub fn work_args(&self) -> &WorkArgs {
        &self.work_args
    }

    /// Whether `work` results are sent back to the controller.
    pub fn forward_results(&self) -> bool {
        self.forward_results
    }

    /// Command starting the process of every run.
    pub fn host(&self) -> &HostCommand {
        &self.host
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("name cannot be empty");
        }

        if self.name.contains('\0') {
            bail!("name cannot contain NUL bytes");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct WorkerConfigBuilder {
    name: Option<String>,
    work_timeout: Option<Duration>,
    work_timeout_secs: Option<f64>,
    work_args: Option<WorkArgs>,
    forward_results: Option<bool>,
    host: Option<HostCommand>,
}

impl WorkerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout = Some(timeout);
        self.work_timeout_secs = None;
        self
    }

    /// Float seconds, as commonly written for polling periods (`0.05`).
    /// Negative, NaN and infinite values are rejected by `build`.
    pub fn work_timeout_secs(mut self, seconds: f64) -> Self {
        self.work_timeout_secs = Some(seconds);
        self.work_timeout = None;
        self
    }

    pub fn work_args(mut self, args: WorkArgs) -> Self {
        self.work_args = Some(args);
        self
    }

    pub fn forward_results(mut self, forward: bool) -> Self {
        self.forward_results = Some(forward);
        self
    }

    pub fn host(mut self, host: HostCommand) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> Result<WorkerConfig> {
        let work_timeout = match (self.work_timeout, self.work_timeout_secs) {
            (Some(timeout), _) => timeout,
            (None, Some(seconds)) => secs_to_duration(seconds)?,
            (None, None) => Duration::ZERO,
        };

        let params = WorkerConfigParams {
            name: self.name.context("name is required")?,
            work_timeout,
            work_args: self.work_args.unwrap_or_default(),
            forward_results: self.forward_results.unwrap_or(true),
            host: self.host.unwrap_or_default(),
        };

        WorkerConfig::new(params)
    }
}

/// Worker options plus the consumer's buffering and queue policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    worker: WorkerConfig,
    max_buffer_size: usize,
    lossy_queue: bool,
    queue_capacity: usize,
}

pub struct ConsumerConfigParams {
    pub worker: WorkerConfig,
    pub max_buffer_size: usize,
    pub lossy_queue: bool,
    pub queue_capacity: usize,
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    pub fn new(params: ConsumerConfigParams) -> Result<Self> {
        let ConsumerConfigParams {
            worker,
            max_buffer_size,
            lossy_queue,
            queue_capacity,
        } = params;

        let config = Self {
            worker,
            max_buffer_size,
            lossy_queue,
            queue_capacity,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn worker(&self) -> &WorkerConfig {
        &self.worker
    }

    /// Buffered item count that triggers a `work` call.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Whether the work queue evicts its oldest item instead of blocking writers.
    pub fn lossy_queue(&self) -> bool {
        self.lossy_queue
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;

        if self.max_buffer_size == 0 {
            bail!("max_buffer_size must be greater than 0");
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConsumerConfigBuilder {
    worker: WorkerConfigBuilder,
    max_buffer_size: Option<usize>,
    lossy_queue: Option<bool>,
    queue_capacity: Option<usize>,
}

impl ConsumerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.worker = self.worker.name(name);
        self
    }

    pub fn work_timeout(mut self, timeout: Duration) -> Self {
        self.worker = self.worker.work_timeout(timeout);
        self
    }

    pub fn work_timeout_secs(mut self, seconds: f64) -> Self {
        self.worker = self.worker.work_timeout_secs(seconds);
        self
    }

    pub fn work_args(mut self, args: WorkArgs) -> Self {
        self.worker = self.worker.work_args(args);
        self
    }

    pub fn forward_results(mut self, forward: bool) -> Self {
        self.worker = self.worker.forward_results(forward);
        self
    }

    pub fn host(mut self, host: HostCommand) -> Self {
        self.worker = self.worker.host(host);
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = Some(size);
        self
    }

    pub fn lossy_queue(mut self, lossy: bool) -> Self {
        self.lossy_queue = Some(lossy);
        self
    }

    /// Defaults to `max_buffer_size`.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<ConsumerConfig> {
        let max_buffer_size = self.max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE);
        let params = ConsumerConfigParams {
            worker: self.worker.build()?,
            max_buffer_size,
            lossy_queue: self.lossy_queue.unwrap_or(false),
            queue_capacity: self.queue_capacity.unwrap_or(max_buffer_size),
        };

        ConsumerConfig::new(params)
    }
}

fn secs_to_duration(seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("work_timeout must be a finite, non-negative number of seconds (got {seconds})");
    }
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("work_timeout of {seconds} seconds is out of range"))
}
