use crate::channel::MessagePipe;
use crate::worker::args::WorkArgs;
use crate::worker::protocol::Payload;
use crate::worker::state::RunState;
use anyhow::{anyhow, Error as AnyError, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Callbacks shared by producers and consumers.
///
/// Every callback is an associated function without `self`: a run only sees
/// what is passed in explicitly, never the controller-side worker object.
/// All of them run inside the worker process.
pub trait WorkerCallbacks: 'static {
    /// Value returned by `on_start` and lent to every later callback of the run.
    type Context: Default + 'static;
    /// Per-run mutable state, created with `Default::default()` at run start.
    type State: Default + 'static;
    /// Payload exchanged with the controller over the message channel.
    type Message: Payload;

    fn on_start(
        _state: &mut RunState<Self::State>,
        _pipe: &mut MessagePipe<Self::Message>,
        _args: &WorkArgs,
    ) -> Result<Self::Context> {
        Ok(Self::Context::default())
    }

    fn on_stop(
        _context: &mut Self::Context,
        _state: &mut RunState<Self::State>,
        _pipe: &mut MessagePipe<Self::Message>,
        _args: &WorkArgs,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStage {
    Start,
    Work,
    Stop,
}

impl fmt::Display for CallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallbackStage::Start => "on_start",
            CallbackStage::Work => "work",
            CallbackStage::Stop => "on_stop",
        };
        f.write_str(label)
    }
}

/// A callback returned an error or panicked. Ends the run that raised it.
#[derive(Debug)]
pub struct CallbackError {
    worker: String,
    stage: CallbackStage,
    source: AnyError,
}

impl CallbackError {
    pub fn new(worker: impl Into<String>, stage: CallbackStage, source: AnyError) -> Self {
        Self {
            worker: worker.into(),
            stage,
            source,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn stage(&self) -> CallbackStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker `{}` failed in {}: {}",
            self.worker, self.stage, self.source
        )
    }
}

impl std::error::Error for CallbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Runs one callback, turning both an `Err` and a panic into a [`CallbackError`].
pub(crate) fn invoke<T>(
    worker: &str,
    stage: CallbackStage,
    call: impl FnOnce() -> Result<T>,
) -> Result<T, CallbackError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(CallbackError::new(worker, stage, err)),
        Err(panic_payload) => {
            let panic_msg = panic_message(panic_payload.as_ref());
            Err(CallbackError::new(
                worker,
                stage,
                anyhow!("callback panicked: {panic_msg}"),
            ))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
