//! Subscription handle and its register/unsubscribe flows.

use crate::connection::Shared;
use crate::dispatch::{DispatchLoop, DispatchSink, DispatchState, DispatchStats, MessageHandler};
use crate::error::{ConnectionError, SubscribeError};
use crate::subject;
use crate::transport::{ServerFrame, SubscribeRejection};
use std::fmt;
use std::sync::Arc;

use super::manager::SubscriptionEntry;
use super::types::{SubscriptionId, SubscriptionOptions, SubscriptionState};

/// A registered subscription.
///
/// Dropping the handle does not stop delivery; call [`unsubscribe`] or
/// [`close_durable`], or close the session.
///
/// [`unsubscribe`]: Subscription::unsubscribe
/// [`close_durable`]: Subscription::close_durable
pub struct Subscription {
    shared: Arc<Shared>,
    entry: Arc<SubscriptionEntry>,
}

impl Subscription {
    pub(crate) fn register(
        shared: &Arc<Shared>,
        subject: &str,
        options: SubscriptionOptions,
        handler: MessageHandler,
    ) -> Result<Self, SubscribeError> {
        subject::validate_pattern(subject).map_err(SubscribeError::SubjectInvalid)?;
        options.validate().map_err(SubscribeError::InvalidOptions)?;
        if shared.is_closed() {
            return Err(SubscribeError::ConnectionClosed);
        }

        if let (Some(durable), None) = (&options.durable_name, &options.queue_group) {
            if shared.subscriptions.has_active_durable(subject, durable) {
                return Err(SubscribeError::DuplicateDurable(durable.clone()));
            }
        }

        let id = shared.subscriptions.next_id();
        let sink: Arc<dyn DispatchSink> = shared.clone();
        let dispatch = DispatchLoop::spawn(id, handler, options.ack_policy, sink)
            .map_err(|e| SubscribeError::Connection(ConnectionError::Spawn(e.to_string())))?;
        let entry = Arc::new(SubscriptionEntry::new(
            id,
            subject.to_string(),
            options,
            dispatch,
        ));

        // Registered before the request so early deliveries have a home.
        if !shared.subscriptions.insert(Arc::clone(&entry)) {
            entry.transition(SubscriptionState::Closed);
            entry.stop_dispatch();
            return Err(SubscribeError::ConnectionClosed);
        }

        let start = entry.options.start;
        let reply = shared.request(
            |request_id| entry.subscribe_frame(request_id, start),
            shared.options.request_timeout,
        );
        if let Err(e) = subscribe_outcome(reply) {
            if e == SubscribeError::Timeout {
                // The broker may have attached the member without the
                // reply making it back.
                let frame = entry.unsubscribe_frame(shared.next_request_id(), false);
                if let Err(send_error) = shared.send(frame) {
                    tracing::debug!(subscription = %id, error = %send_error, "cleanup unsubscribe not sent");
                }
            }
            shared.subscriptions.remove(id);
            entry.transition(SubscriptionState::Closed);
            entry.stop_dispatch();
            tracing::debug!(subscription = %id, %subject, error = %e, "subscribe failed");
            return Err(e);
        }

        tracing::info!(
            client_id = %shared.client_id,
            subscription = %id,
            %subject,
            queue_group = ?entry.options.queue_group,
            durable_name = ?entry.options.durable_name,
            "subscribed"
        );

        Ok(Self {
            shared: Arc::clone(shared),
            entry,
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.entry.id
    }

    pub fn subject(&self) -> &str {
        &self.entry.subject
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.entry.options
    }

    pub fn state(&self) -> SubscriptionState {
        self.entry.state()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.entry.dispatch_state()
    }

    pub fn stats(&self) -> DispatchStats {
        self.entry.stats()
    }

    /// Stop delivery. A durable cursor is kept by the broker, so
    /// subscribing again with the same durable name resumes from it.
    ///
    /// Calling this again, or after the session closed, does nothing,
    /// unless the earlier call failed to reach the broker; then the
    /// request is sent again.
    pub fn unsubscribe(&self) -> Result<(), SubscribeError> {
        self.detach(false)
    }

    /// Stop delivery and erase the durable cursor. Also works on a
    /// durable subscription that was already unsubscribed.
    pub fn close_durable(&self) -> Result<(), SubscribeError> {
        self.detach(true)
    }

    fn detach(&self, close_durable: bool) -> Result<(), SubscribeError> {
        let target = if close_durable {
            SubscriptionState::Closed
        } else {
            SubscriptionState::Unsubscribed
        };

        match self.entry.transition(target) {
            Some(SubscriptionState::Active) => {
                self.entry.stop_dispatch();
                self.shared.subscriptions.remove(self.entry.id);
            }
            // Broker-side member is already gone; only the cursor remains.
            Some(SubscriptionState::Unsubscribed) if self.entry.is_durable() => {}
            None if self.entry.take_unconfirmed(close_durable) => {}
            _ => return Ok(()),
        }

        if self.shared.is_closed() {
            return Ok(());
        }

        let reply = self.shared.request(
            |request_id| self.entry.unsubscribe_frame(request_id, close_durable),
            self.shared.options.request_timeout,
        );
        match reply {
            Ok(ServerFrame::UnsubscribeReply { error: None, .. }) => {
                tracing::info!(
                    subscription = %self.entry.id,
                    subject = %self.entry.subject,
                    close_durable,
                    "unsubscribed"
                );
                Ok(())
            }
            Ok(ServerFrame::UnsubscribeReply {
                error: Some(error), ..
            }) => Err(SubscribeError::Rejected(error)),
            Ok(other) => Err(unexpected(&other)),
            Err(ConnectionError::Closed) => Ok(()),
            Err(e) => {
                // Not confirmed: a later call of the same kind sends it again.
                self.entry.mark_unconfirmed(close_durable);
                tracing::debug!(
                    subscription = %self.entry.id,
                    close_durable,
                    error = %e,
                    "unsubscribe not confirmed"
                );
                Err(e.into())
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("subject", &self.entry.subject)
            .field("state", &self.entry.state())
            .finish()
    }
}

fn subscribe_outcome(reply: Result<ServerFrame, ConnectionError>) -> Result<(), SubscribeError> {
    match reply? {
        ServerFrame::SubscribeReply { error: None, .. } => Ok(()),
        ServerFrame::SubscribeReply {
            error: Some(rejection),
            ..
        } => Err(rejection.into()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(frame: &ServerFrame) -> SubscribeError {
    SubscribeError::Rejected(format!("unexpected reply: {:?}", frame))
}

impl From<SubscribeRejection> for SubscribeError {
    fn from(rejection: SubscribeRejection) -> Self {
        match rejection {
            SubscribeRejection::SubjectInvalid(reason) => SubscribeError::SubjectInvalid(reason),
            SubscribeRejection::DuplicateDurable(name) => SubscribeError::DuplicateDurable(name),
            SubscribeRejection::Other(reason) => SubscribeError::Rejected(reason),
        }
    }
}
