//! Bounded queue between the ingestion and classification stages.
//!
//! The two stages run on separate runtimes, so the queue is a `flume`
//! channel: its async halves can be awaited from any executor. A full queue
//! suspends `put`, an empty one suspends `get`, and both give up as soon as
//! the cancellation token fires.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandoffError {
    #[error("Handoff cancelled")]
    Cancelled,

    #[error("Handoff queue closed")]
    Closed,
}

/// Create a queue holding at most `capacity` items.
pub fn bounded<T>(capacity: usize) -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = flume::bounded(capacity);
    (
        HandoffSender { tx, capacity },
        HandoffReceiver { rx, capacity },
    )
}

#[derive(Debug)]
pub struct HandoffSender<T> {
    tx: flume::Sender<T>,
    capacity: usize,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> HandoffSender<T> {
    /// Enqueue `item`, waiting while the queue is full.
    ///
    /// On cancellation the item is dropped.
    pub async fn put(&self, item: T, token: &CancellationToken) -> Result<(), HandoffError> {
        if token.is_cancelled() {
            return Err(HandoffError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HandoffError::Cancelled),
            sent = self.tx.send_async(item) => sent.map_err(|_| HandoffError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
pub struct HandoffReceiver<T> {
    rx: flume::Receiver<T>,
    capacity: usize,
}

impl<T> Clone for HandoffReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> HandoffReceiver<T> {
    /// Dequeue the next item, waiting while the queue is empty.
    pub async fn get(&self, token: &CancellationToken) -> Result<T, HandoffError> {
        if token.is_cancelled() {
            return Err(HandoffError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HandoffError::Cancelled),
            received = self.rx.recv_async() => received.map_err(|_| HandoffError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
