//! Subscription registry for a session.

use crate::dispatch::{DispatchLoop, DispatchState, DispatchStats};
use crate::transport::ClientFrame;
use crate::types::{Message, StartPosition};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{SubscriptionId, SubscriptionOptions, SubscriptionState};

/// Internal subscription state.
pub(crate) struct SubscriptionEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) subject: String,
    pub(crate) options: SubscriptionOptions,
    state: Mutex<SubscriptionState>,
    /// Detach request the broker has not confirmed, by `close_durable`.
    unconfirmed: Mutex<Option<bool>>,
    dispatch: DispatchLoop,
}

impl SubscriptionEntry {
    pub(crate) fn new(
        id: SubscriptionId,
        subject: String,
        options: SubscriptionOptions,
        dispatch: DispatchLoop,
    ) -> Self {
        Self {
            id,
            subject,
            options,
            state: Mutex::new(SubscriptionState::Active),
            unconfirmed: Mutex::new(None),
            dispatch,
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Move to `target` and return the state it left.
    ///
    /// Active can move anywhere and Unsubscribed can still be closed.
    /// Anything else is refused with `None`, which makes repeated
    /// unsubscribe and close calls no-ops.
    pub(crate) fn transition(&self, target: SubscriptionState) -> Option<SubscriptionState> {
        let mut state = self.state.lock();
        let previous = *state;
        let allowed = matches!(
            (previous, target),
            (SubscriptionState::Active, SubscriptionState::Unsubscribed)
                | (SubscriptionState::Active, SubscriptionState::Closed)
                | (SubscriptionState::Unsubscribed, SubscriptionState::Closed)
        );
        if !allowed {
            return None;
        }
        *state = target;
        Some(previous)
    }

    /// Remember a detach request that failed in transit.
    pub(crate) fn mark_unconfirmed(&self, close_durable: bool) {
        *self.unconfirmed.lock() = Some(close_durable);
    }

    /// Claim a failed detach of the same kind for another attempt.
    pub(crate) fn take_unconfirmed(&self, close_durable: bool) -> bool {
        let mut unconfirmed = self.unconfirmed.lock();
        if *unconfirmed == Some(close_durable) {
            *unconfirmed = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.options.durable_name.is_some()
    }

    /// Hand a message to the dispatch loop.
    fn deliver(&self, message: Message) -> bool {
        self.state() == SubscriptionState::Active && self.dispatch.enqueue(message)
    }

    /// Stop the dispatch loop, waiting for a running handler to return.
    pub(crate) fn stop_dispatch(&self) {
        self.dispatch.stop();
        self.dispatch.join();
    }

    /// Stop the dispatch loop without waiting for it.
    pub(crate) fn halt(&self) {
        self.dispatch.stop();
    }

    pub(crate) fn dispatch_state(&self) -> DispatchState {
        self.dispatch.state()
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        self.dispatch.stats()
    }

    pub(crate) fn subscribe_frame(&self, request_id: u64, start: StartPosition) -> ClientFrame {
        ClientFrame::Subscribe {
            request_id,
            inbox: self.id,
            subject: self.subject.clone(),
            queue_group: self.options.queue_group.clone(),
            durable_name: self.options.durable_name.clone(),
            start,
            max_inflight: self.options.max_inflight,
            ack_wait_ms: u64::try_from(self.options.ack_wait.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub(crate) fn unsubscribe_frame(&self, request_id: u64, close_durable: bool) -> ClientFrame {
        ClientFrame::Unsubscribe {
            request_id,
            inbox: self.id,
            subject: self.subject.clone(),
            queue_group: self.options.queue_group.clone(),
            durable_name: self.options.durable_name.clone(),
            close_durable,
        }
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<SubscriptionId, Arc<SubscriptionEntry>>,
    /// Set once the session closes; no more registrations.
    closed: bool,
}

/// Tracks the live subscriptions of one session and routes deliveries
/// to their dispatch loops.
pub struct SubscriptionManager {
    registry: RwLock<Registry>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register an entry. Fails once the session is closed.
    pub(crate) fn insert(&self, entry: Arc<SubscriptionEntry>) -> bool {
        let mut registry = self.registry.write();
        if registry.closed {
            return false;
        }
        registry.entries.insert(entry.id, entry);
        true
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<Arc<SubscriptionEntry>> {
        self.registry.write().entries.remove(&id)
    }

    /// Route a delivered message. Returns false if no live subscription
    /// owns the inbox.
    pub(crate) fn deliver(&self, id: SubscriptionId, message: Message) -> bool {
        let registry = self.registry.read();
        match registry.entries.get(&id) {
            Some(entry) => entry.deliver(message),
            None => false,
        }
    }

    /// Whether a non-queue durable with this name and subject is active.
    pub(crate) fn has_active_durable(&self, subject: &str, durable_name: &str) -> bool {
        self.registry.read().entries.values().any(|entry| {
            entry.subject == subject
                && entry.options.queue_group.is_none()
                && entry.options.durable_name.as_deref() == Some(durable_name)
                && entry.state() == SubscriptionState::Active
        })
    }

    /// Active subscriptions, oldest first.
    pub(crate) fn active(&self) -> Vec<Arc<SubscriptionEntry>> {
        let mut active: Vec<_> = self
            .registry
            .read()
            .entries
            .values()
            .filter(|entry| entry.state() == SubscriptionState::Active)
            .cloned()
            .collect();
        active.sort_by_key(|entry| entry.id);
        active
    }

    /// Close every subscription and refuse new ones. Dispatch loops finish
    /// their current handler call before this returns.
    pub(crate) fn close_all(&self) -> usize {
        let entries: Vec<_> = {
            let mut registry = self.registry.write();
            registry.closed = true;
            registry.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            entry.transition(SubscriptionState::Closed);
            entry.dispatch.stop();
        }
        for entry in &entries {
            entry.dispatch.join();
        }
        entries.len()
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.registry.read().entries.len()
    }

    /// IDs of registered subscriptions, in creation order.
    pub fn ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.registry.read().entries.keys().copied().collect();
        ids.sort();
        ids
    }
}
