//! Connection lifecycle event bus.
//!
//! Sessions publish an event whenever a connection is opened or closed.
//! Interested components subscribe and receive events in publish order;
//! dropping the receiver ends the subscription, so a forgotten listener
//! cannot outlive its owner.
//!
//! Publishing never blocks and never fails: with no live subscribers the
//! event is simply discarded.

use tokio::sync::broadcast;

use crate::session::ConnectionKey;

/// Capacity of the broadcast channel backing the bus. A subscriber that
/// lags behind by more than this many events observes a `Lagged` error
/// on its receiver rather than stalling publishers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A connection lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An authenticated session to the keyed host was established.
    Opened(ConnectionKey),
    /// The session to the keyed host was disconnected.
    Closed(ConnectionKey),
}

impl ConnectionEvent {
    /// The connection key this event concerns.
    pub fn key(&self) -> &ConnectionKey {
        match self {
            ConnectionEvent::Opened(key) | ConnectionEvent::Closed(key) => key,
        }
    }
}

/// Broadcast bus for [`ConnectionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to connection events. Dropping the returned receiver
    /// ends the subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: ConnectionEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
