//! Line protocol between the controller and a worker process.
//!
//! Every frame is one JSON object on its own line. The controller writes
//! [`Command`]s to the worker's stdin, the worker answers with [`Report`]s on
//! its stdout. Work outputs, queue items and messages travel as JSON values
//! and are decoded into the worker's types at either end.

use crate::worker::args::WorkArgs;
use crate::worker::callbacks::CallbackStage;
use crate::worker::monitor::WorkerExit;
use crate::worker::state::Lifecycle;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Values that cross the process boundary: work outputs, queue items and
/// messages.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Which loop a worker process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// Everything a worker process needs to start its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Launch {
    pub worker: String,
    pub role: Role,
    /// Type name of the callbacks, used to find them in the worker's registry.
    pub kind: String,
    pub args: WorkArgs,
    pub work_timeout: Duration,
    pub max_buffer_size: usize,
}

/// Controller → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Command {
    Launch(Launch),
    Message { payload: Value },
    /// A produced value reached every subscribed queue (or was abandoned).
    Pushed,
    /// Answer to [`Report::Take`]; may be empty.
    Items { items: Vec<Value> },
    Stop,
    Drain,
}

/// Worker → controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Report {
    /// First frame of every worker process.
    Ready,
    Message { payload: Value },
    /// Producer output; the worker waits for [`Command::Pushed`].
    Produced { payload: Value },
    /// Consumer output.
    Result { payload: Value },
    /// Consumer asks for up to `limit` items, waiting at most `wait` for the
    /// first one (`None` waits until one arrives).
    Take { limit: usize, wait: Option<Duration> },
    Failed { stage: CallbackStage, error: String },
    /// A callback asked the run to stop or drain.
    Requested { lifecycle: Lifecycle },
    /// Consumer loop ended with `buffered` items it never processed.
    Retired { buffered: usize },
    Exited { exit: WorkerExit },
}

pub(crate) trait Frame: Serialize + DeserializeOwned {
    fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).context("failed to encode frame")?;
        line.push('\n');
        Ok(line)
    }

    fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }
}

impl Frame for Command {}

impl Frame for Report {}

pub(crate) async fn write_frame<W, F>(writer: &mut W, frame: &F) -> Result<()>
where
    W: AsyncWrite + Unpin,
    F: Frame,
{
    let line = frame.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> serde_json::Result<Value> {
    serde_json::to_value(value)
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
    serde_json::from_value(value)
}
