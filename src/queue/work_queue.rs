use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// What happened to an item handed to [`WorkQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// The queue was full and lossy, so the oldest item was evicted to admit
    /// the new one.
    EvictedOldest,
    /// Returned by [`WorkQueue::push_if_ready`] when the owning consumer has
    /// no run accepting items. The item was dropped.
    NotReady,
}

/// Bounded FIFO connecting any number of producers to one consumer.
///
/// Lossless queues exert backpressure: `push` waits while the queue is full.
/// Lossy queues never wait; once full, each push evicts the oldest item and
/// bumps [`WorkQueue::evicted`].
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    lossy: bool,
    ready: AtomicBool,
    depth: AtomicUsize,
    evicted: AtomicU64,
}

impl<T> WorkQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn lossless(capacity: usize) -> Self {
        Self::with_policy(capacity, false)
    }

    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn lossy(capacity: usize) -> Self {
        Self::with_policy(capacity, true)
    }

    /// Queues built by a [`crate::Consumer`] take their capacity from a
    /// validated [`crate::ConsumerConfig`], which rejects zero.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_policy(capacity: usize, lossy: bool) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            notify: Notify::new(),
            capacity,
            lossy,
            ready: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Adds `item` whether or not a consumer run is accepting items.
    pub async fn push(&self, item: T) -> PushOutcome {
        self.push_inner(item, false).await
    }

    /// Like [`WorkQueue::push`], but drops `item` with
    /// [`PushOutcome::NotReady`] when no consumer run is accepting items.
    /// Readiness is checked under the queue lock, so a push that was waiting
    /// for room when the consumer retired never lands.
    pub async fn push_if_ready(&self, item: T) -> PushOutcome {
        self.push_inner(item, true).await
    }

    async fn push_inner(&self, item: T, require_ready: bool) -> PushOutcome {
        loop {
            let notified = self.notify.notified();
            {
                let mut items = self.items.lock().await;
                if require_ready && !self.is_ready() {
                    return PushOutcome::NotReady;
                }
                if items.len() < self.capacity || self.lossy {
                    let outcome = if items.len() >= self.capacity {
                        items.pop_front();
                        let evicted = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::trace!(
                            capacity = self.capacity,
                            evicted,
                            "lossy queue full; evicted oldest item"
                        );
                        PushOutcome::EvictedOldest
                    } else {
                        PushOutcome::Enqueued
                    };
                    items.push_back(item);
                    self.depth.store(items.len(), Ordering::Release);
                    drop(items);
                    self.notify.notify_waiters();
                    return outcome;
                }
            }
            notified.await;
        }
    }

    /// Waits until an item is available and removes it.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop().await {
                return item;
            }
            notified.await;
        }
    }

    /// Like [`WorkQueue::pop`] but gives up after `wait`.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        if wait.is_zero() {
            return self.try_pop().await;
        }
        tokio::time::timeout(wait, self.pop()).await.ok()
    }

    pub async fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock().await;
        let item = items.pop_front();
        if item.is_some() {
            self.depth.store(items.len(), Ordering::Release);
            drop(items);
            self.notify.notify_waiters();
        }
        item
    }

    /// Moves up to `limit` queued items into `buffer`, oldest first, without
    /// waiting. Returns how many were moved.
    pub async fn drain_into(&self, buffer: &mut Vec<T>, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        let mut items = self.items.lock().await;
        let count = items.len().min(limit);
        buffer.extend(items.drain(..count));
        self.depth.store(items.len(), Ordering::Release);
        drop(items);
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// Drops every queued item and returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut items = self.items.lock().await;
        let removed = items.len();
        items.clear();
        self.depth.store(0, Ordering::Release);
        drop(items);
        self.notify.notify_waiters();
        removed
    }

    /// Marks the queue not ready and empties it under one lock, waking
    /// blocked writers. Returns how many items were removed.
    pub(crate) async fn retire(&self) -> usize {
        let mut items = self.items.lock().await;
        self.set_ready(false);
        let removed = items.len();
        items.clear();
        self.depth.store(0, Ordering::Release);
        drop(items);
        self.notify.notify_waiters();
        removed
    }

    /// Number of queued items. Lock-free, so it may lag a concurrent push/pop.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    /// Items evicted so far by the lossy policy.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Whether the owning consumer currently has a run accepting items.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("lossy", &self.lossy)
            .field("ready", &self.is_ready())
            .field("evicted", &self.evicted())
            .finish()
    }
}

/// Pushes controller-originated data into a consumer's queue, through the
/// same path producer output takes.
pub async fn put_in_queue<T>(queue: &WorkQueue<T>, item: T) -> PushOutcome {
    queue.push(item).await
}
