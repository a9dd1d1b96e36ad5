//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes events that have already been committed to the ledger's
//! outbox. It is not a source of truth:
//!
//! - **At-least-once delivery**: the outbox relay may publish an event again after a
//!   crash between publish and acknowledgement; consumers de-duplicate by `event_id`
//! - **No persistence**: a failed publish leaves the outbox row pending for the next drain
//! - **Topic routing**: subscribers may listen to every topic or to a single one

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription receives its own copy of every matching message (broadcast
/// semantics). Messages arrive in publish order for a single publisher.
///
/// ```ignore
/// let sub = bus.subscribe_topic("inventory.product");
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(envelope) => handle(envelope)?,
///         Err(RecvTimeoutError::Timeout) => continue,  // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take every message that is already buffered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Topic-routed pub/sub abstraction.
///
/// `publish` is fire-and-forget from the caller's perspective: success means the
/// transport accepted the message, not that any consumer processed it.
///
/// The trait requires `Send + Sync`; the outbox relay publishes from async tasks.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    /// Subscribe to every topic.
    fn subscribe(&self) -> Subscription<M>;

    /// Subscribe to a single topic.
    fn subscribe_topic(&self, topic: &str) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn subscribe_topic(&self, topic: &str) -> Subscription<M> {
        (**self).subscribe_topic(topic)
    }
}
