use anyhow::Error as AnyError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Keeps the first failure of a run so `join` can hand it back.
///
/// Shared by the result monitor, which records callback failures and
/// unexpected exits, and the controller handle, which takes the error.
#[derive(Clone, Default)]
pub(crate) struct FailureRecorder {
    inner: Arc<FailureInner>,
}

#[derive(Default)]
struct FailureInner {
    triggered: AtomicBool,
    captured_error: Mutex<Option<AnyError>>,
}

impl FailureRecorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores `error` unless an earlier failure was already captured.
    /// Returns whether this call captured it.
    pub(crate) fn record(&self, error: AnyError) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(error = %error, "run already failed; ignoring later failure");
            return false;
        }

        let mut slot = self
            .inner
            .captured_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(error);
        true
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Takes the captured failure. Later calls return `None`.
    pub(crate) fn take(&self) -> Option<AnyError> {
        self.inner
            .captured_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
