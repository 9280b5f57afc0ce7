//! Thin wrapper around `crossbeam::channel` used for every internal bus in
//! the daemon: thread-stop signalling, lifecycle event dispatch, and the
//! metrics fan-out bus.

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded, unbounded};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("error while publishing event: {0}")]
    SendError(String),
    #[error("subscriber buffer is full, event dropped")]
    Full,
}

pub struct EventPublisher<E>(Sender<E>);

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> EventPublisher<E> {
    /// Blocking send; used for unbounded buses where the only failure mode
    /// is "nobody is listening anymore".
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }

    /// Non-blocking send; used for bounded buses where backpressure must
    /// never stall the publisher (the metrics sampler, in particular).
    pub fn try_publish(&self, event: E) -> Result<(), EventPublisherError> {
        match self.0.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EventPublisherError::Full),
            Err(TrySendError::Disconnected(_)) => {
                Err(EventPublisherError::SendError("disconnected".to_string()))
            }
        }
    }
}

pub struct EventConsumer<E>(Receiver<E>);

impl<E> Clone for EventConsumer<E> {
    fn clone(&self) -> Self {
        EventConsumer(self.0.clone())
    }
}

impl<E> EventConsumer<E> {
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<E, RecvTimeoutError> {
        self.0.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<E, TryRecvError> {
        self.0.try_recv()
    }

    pub fn is_cancelled(&self, wait: std::time::Duration) -> bool {
        matches!(self.0.recv_timeout(wait), Ok(_) | Err(RecvTimeoutError::Disconnected))
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}

/// An unbounded publisher/consumer pair. Used for the supervisor-wide
/// lifecycle event bus and per-thread stop signalling, where the volume of
/// messages is inherently small and bounded by human/process activity.
pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = unbounded();
    (EventPublisher(s), EventConsumer(r))
}

/// A bounded publisher/consumer pair. Used for the metrics subscriber bus,
/// where a slow consumer must never block the sampler — `try_publish`
/// silently drops once the receiver's buffer (`capacity`) is full.
pub fn bounded_pub_sub<E>(capacity: usize) -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = bounded(capacity);
    (EventPublisher(s), EventConsumer(r))
}
