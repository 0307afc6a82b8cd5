use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a worker run.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Never started.
    Idle = 0,
    Running = 1,
    /// Stop requested; the loop exits after the call in flight.
    Stopping = 2,
    /// Consumer only: one final `work` call on everything buffered, then exit.
    Draining = 3,
    Terminated = 4,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Idle,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            3 => Lifecycle::Draining,
            _ => Lifecycle::Terminated,
        }
    }

    /// `true` while a run exists that has not terminated yet.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Lifecycle::Running | Lifecycle::Stopping | Lifecycle::Draining
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Draining => "draining",
            Lifecycle::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Lifecycle cell of one run. The controller and the worker process each
/// keep one and mirror stop and drain requests to the other side over the
/// pipe. Any stop request also cancels `signal`, waking the owner wherever it
/// is waiting.
#[derive(Debug)]
pub(crate) struct RunControl {
    state: AtomicU8,
    signal: CancellationToken,
}

impl RunControl {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(Lifecycle::Running as u8),
            signal: CancellationToken::new(),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// `Running`/`Draining` → `Stopping`. Returns whether the state changed.
    pub(crate) fn request_stop(&self) -> bool {
        let changed = self.transition(
            |current| matches!(current, Lifecycle::Running | Lifecycle::Draining),
            Lifecycle::Stopping,
        );
        self.signal.cancel();
        changed
    }

    /// `Running` → `Draining`. Returns whether the state changed.
    pub(crate) fn request_drain(&self) -> bool {
        let changed = self.transition(|current| current == Lifecycle::Running, Lifecycle::Draining);
        if changed {
            self.signal.cancel();
        }
        changed
    }

    pub(crate) fn mark_terminated(&self) {
        self.state
            .store(Lifecycle::Terminated as u8, Ordering::SeqCst);
        self.signal.cancel();
    }

    /// Resolves once any stop or drain has been requested.
    pub(crate) fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    fn transition(&self, allowed: impl Fn(Lifecycle) -> bool, next: Lifecycle) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                allowed(Lifecycle::from_u8(raw)).then_some(next as u8)
            })
            .is_ok()
    }
}

/// Per-run mutable state handed to every callback.
///
/// Dereferences to the worker's `State` type, created fresh with
/// `Default::default()` when a run starts and dropped when it ends.
pub struct RunState<S> {
    inner: S,
    worker: Arc<str>,
    control: Arc<RunControl>,
}

impl<S> RunState<S> {
    pub(crate) fn new(inner: S, worker: Arc<str>, control: Arc<RunControl>) -> Self {
        Self {
            inner,
            worker,
            control,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.control.lifecycle()
    }

    /// Ends the run after the current callback returns.
    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// Consumers flush everything still buffered or queued through one last
    /// `work` call before exiting. Producers treat this as a plain stop.
    pub fn request_stop_at_queue_end(&self) {
        self.control.request_drain();
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> Deref for RunState<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.inner
    }
}

impl<S> DerefMut for RunState<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: fmt::Debug> fmt::Debug for RunState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("worker", &self.worker)
            .field("lifecycle", &self.lifecycle())
            .field("inner", &self.inner)
            .finish()
    }
}
