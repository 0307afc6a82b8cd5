//! Duplex channel pairs linking the controller to a worker run.
//!
//! A pair has a parent endpoint, held by the controller, and a child endpoint
//! that is moved into the worker run. Each direction preserves send order and
//! is independent of the other. Dropping either endpoint closes the pair, which
//! is how controller-side monitors learn that a run has ended.

use std::fmt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Child-side message endpoint handed to every worker callback.
pub type MessagePipe<M> = Endpoint<M, M>;

/// Controller-held sending half of a worker's message channel.
pub type MessageSender<M> = EndpointSender<M>;

/// Returned when the peer endpoint has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("peer endpoint closed")
    }
}

impl std::error::Error for ChannelClosed {}

/// Creates a connected `(parent, child)` pair.
///
/// The parent sends `D` (downstream, towards the worker) and receives `U`
/// (upstream, towards the controller); the child does the opposite.
pub fn channel_pair<D, U>() -> (Endpoint<D, U>, Endpoint<U, D>) {
    let (down_tx, down_rx) = mpsc::unbounded_channel();
    let (up_tx, up_rx) = mpsc::unbounded_channel();
    (
        Endpoint::new(EndpointSender::new(down_tx), EndpointReceiver::new(up_rx)),
        Endpoint::new(EndpointSender::new(up_tx), EndpointReceiver::new(down_rx)),
    )
}

/// One side of a channel pair.
pub struct Endpoint<S, R> {
    sender: EndpointSender<S>,
    receiver: EndpointReceiver<R>,
}

impl<S, R> Endpoint<S, R> {
    fn new(sender: EndpointSender<S>, receiver: EndpointReceiver<R>) -> Self {
        Self { sender, receiver }
    }

    /// Sends a value to the peer without blocking.
    pub fn send(&self, value: S) -> Result<(), ChannelClosed> {
        self.sender.send(value)
    }

    /// Returns `true` when a value is waiting to be received.
    pub fn poll(&mut self) -> bool {
        self.receiver.poll()
    }

    /// Takes the next waiting value, if any, without blocking.
    pub fn try_recv(&mut self) -> Option<R> {
        self.receiver.try_recv()
    }

    /// Takes every value currently waiting, in send order.
    pub fn drain(&mut self) -> Vec<R> {
        self.receiver.drain()
    }

    /// Waits for the next value. Returns `None` once the peer is gone and
    /// everything it sent has been received.
    pub async fn recv(&mut self) -> Option<R> {
        self.receiver.recv().await
    }

    /// Returns `true` once the peer's receiving side has been dropped.
    pub fn is_peer_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn split(self) -> (EndpointSender<S>, EndpointReceiver<R>) {
        (self.sender, self.receiver)
    }
}

impl<S, R> fmt::Debug for Endpoint<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer_closed", &self.is_peer_closed())
            .finish()
    }
}

/// Sending half of an endpoint. Cloning yields another handle to the same
/// direction of the same pair.
pub struct EndpointSender<S> {
    tx: UnboundedSender<S>,
}

impl<S> EndpointSender<S> {
    fn new(tx: UnboundedSender<S>) -> Self {
        Self { tx }
    }

    pub fn send(&self, value: S) -> Result<(), ChannelClosed> {
        self.tx.send(value).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<S> Clone for EndpointSender<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> fmt::Debug for EndpointSender<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half of an endpoint.
pub struct EndpointReceiver<R> {
    rx: UnboundedReceiver<R>,
    peeked: Option<R>,
}

impl<R> EndpointReceiver<R> {
    fn new(rx: UnboundedReceiver<R>) -> Self {
        Self { rx, peeked: None }
    }

    pub fn poll(&mut self) -> bool {
        if self.peeked.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(value) => {
                self.peeked = Some(value);
                true
            }
            Err(_) => false,
        }
    }

    pub fn try_recv(&mut self) -> Option<R> {
        match self.peeked.take() {
            Some(value) => Some(value),
            None => self.rx.try_recv().ok(),
        }
    }

    pub fn drain(&mut self) -> Vec<R> {
        let mut values = Vec::new();
        while let Some(value) = self.try_recv() {
            values.push(value);
        }
        values
    }

    pub async fn recv(&mut self) -> Option<R> {
        if let Some(value) = self.peeked.take() {
            return Some(value);
        }
        self.rx.recv().await
    }
}
