//! Typed fan-out of domain events.
//!
//! A [`Broker`] wraps a bounded `tokio::sync::broadcast` channel. Publishing
//! never blocks and succeeds with zero subscribers; a subscriber that falls
//! more than `capacity` events behind observes `RecvError::Lagged` and keeps
//! receiving from the oldest retained event.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

pub struct Broker<T> {
    tx: broadcast::Sender<Event<T>>,
}

impl<T: Clone + Send + 'static> Broker<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    pub fn publish(&self, kind: EventKind, payload: T) -> usize {
        self.tx.send(Event { kind, payload }).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<T>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for Broker<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
