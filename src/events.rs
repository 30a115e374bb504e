//! Session-level notification channel.
//!
//! Asynchronous conditions that no single call can return (lost
//! connections, reconnects, handler failures) are broadcast to every
//! receiver obtained from [`crate::Connection::events`].

use crate::error::ConnectionError;
use crate::subscriptions::SubscriptionId;
use crate::types::Sequence;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;

/// Events emitted by a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The transport dropped; reconnect attempts are starting.
    Disconnected,

    /// A new transport is in place and subscriptions were re-registered.
    ///
    /// Non-durable subscriptions restart from new messages only; anything
    /// published to them while disconnected is not delivered.
    Reconnected {
        resumed_durables: usize,
        restarted: usize,
    },

    /// Reconnect attempts were exhausted; the session is closed.
    ConnectionLost(ConnectionError),

    /// A subscription handler returned an error or panicked.
    CallbackFailed {
        subscription: SubscriptionId,
        subject: String,
        sequence: Sequence,
        error: String,
        /// Whether the message was acknowledged anyway.
        acked: bool,
    },

    /// A subscription could not be re-registered after a reconnect.
    ResubscribeFailed {
        subscription: SubscriptionId,
        error: String,
    },

    /// The session finished closing.
    Closed,
}

/// Fan-out of session events to any number of bounded receivers.
pub(crate) struct EventBus {
    listeners: RwLock<Vec<Sender<SessionEvent>>>,
    buffer_size: usize,
}

impl EventBus {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Register a new listener.
    pub(crate) fn listen(&self) -> Receiver<SessionEvent> {
        let (sender, receiver) = bounded(self.buffer_size);
        self.listeners.write().push(sender);
        receiver
    }

    /// Broadcast an event. Listeners that are gone are removed; a full
    /// listener misses the event.
    pub(crate) fn emit(&self, event: SessionEvent) {
        self.listeners
            .write()
            .retain(|listener| match listener.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(?event, "event listener buffer full, event dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    /// Drop every listener so receivers observe disconnection.
    pub(crate) fn close(&self) {
        self.listeners.write().clear();
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}
