//! Bounded event queue between the collector and the sender.
//!
//! Many producers, one consumer. Enqueue never blocks: when the queue is full
//! the incoming event is handed back to the caller (drop-newest).

use crate::event::Event;
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("event queue full")]
    Full(Box<Event>),
    #[error("event queue closed")]
    Closed(Box<Event>),
}

impl EnqueueError {
    pub fn into_event(self) -> Event {
        match self {
            EnqueueError::Full(ev) | EnqueueError::Closed(ev) => *ev,
        }
    }
}

pub struct EventQueue;

impl EventQueue {
    /// Create a queue holding at most `capacity` events (0 is treated as 1).
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (QueueProducer, QueueConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (QueueProducer { tx }, QueueConsumer { rx })
    }
}

/// Cloneable producing side.
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<Event>,
}

impl QueueProducer {
    /// Non-blocking enqueue; fails immediately when the queue is full or closed.
    pub fn try_enqueue(&self, event: Event) -> Result<(), EnqueueError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(ev) => EnqueueError::Full(Box::new(ev)),
            mpsc::error::TrySendError::Closed(ev) => EnqueueError::Closed(Box::new(ev)),
        })
    }

    /// Events currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consuming side, owned by the sender.
pub struct QueueConsumer {
    rx: mpsc::Receiver<Event>,
}

impl QueueConsumer {
    /// Wait for the next event; `None` once the queue is closed and drained.
    pub async fn dequeue(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_dequeue(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new events. Already buffered events stay available.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Close and take everything that is still buffered.
    pub fn drain(&mut self) -> Vec<Event> {
        self.close();
        let mut out = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            out.push(ev);
        }
        out
    }
}
