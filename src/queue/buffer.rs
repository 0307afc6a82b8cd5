use std::time::{Duration, Instant};

/// Consumer-side buffer flushed by whichever trigger fires first: the buffer
/// reaching `max_size`, or `work_timeout` elapsing since the last flush.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    max_size: usize,
    work_timeout: Duration,
    items: Vec<T>,
    last_flush: Instant,
}

impl<T> BatchBuffer<T> {
    pub fn new(max_size: usize, work_timeout: Duration, now: Instant) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            work_timeout,
            items: Vec::with_capacity(max_size.min(1_024)),
            last_flush: now,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.extend(items);
    }

    /// Slots left before the size trigger fires.
    pub fn room(&self) -> usize {
        self.max_size.saturating_sub(self.items.len())
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// With a zero timeout the time trigger only fires for a non-empty
    /// buffer, so an idle consumer never spins on empty calls.
    pub fn timed_out(&self, now: Instant) -> bool {
        if self.work_timeout.is_zero() {
            return !self.items.is_empty();
        }
        now.saturating_duration_since(self.last_flush) >= self.work_timeout
    }

    pub fn should_flush(&self, now: Instant) -> bool {
        self.is_full() || self.timed_out(now)
    }

    /// Time left until the timeout trigger, or `None` when there is no
    /// deadline to wait for (zero timeout with an empty buffer).
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.work_timeout.is_zero() {
            return if self.items.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
        }
        let elapsed = now.saturating_duration_since(self.last_flush);
        Some(self.work_timeout.saturating_sub(elapsed))
    }

    /// Empties the buffer and restarts the timeout window at `now`.
    pub fn take(&mut self, now: Instant) -> Vec<T> {
        self.last_flush = now;
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size.min(1_024)))
    }
}
