//! Background threads: frame routing, reconnect and heartbeats.

use super::Shared;
use crate::error::{ConnectionError, SubscribeError};
use crate::events::SessionEvent;
use crate::subscriptions::{SubscriptionEntry, SubscriptionState};
use crate::transport::{ClientFrame, Link, ServerFrame};
use crate::types::{SessionStatus, StartPosition};
use crossbeam_channel::{select, Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on the housekeeping tick, which also paces ack expiry.
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(50);

/// Route inbound frames until shutdown; reconnect on transport loss.
pub(super) fn run(shared: Arc<Shared>, shutdown: Receiver<()>, lost: Receiver<()>) {
    loop {
        let Some(link) = shared.current_link() else {
            break;
        };
        let inbound = link.inbound();
        drop(link);

        let stopping = loop {
            select! {
                recv(inbound) -> frame => match frame {
                    Ok(frame) => shared.route(frame),
                    Err(_) => break false,
                },
                recv(lost) -> _ => break false,
                recv(shutdown) -> _ => break true,
            }
        };

        if stopping || shared.is_closed() {
            break;
        }
        if !reconnect(&shared, &shutdown, &lost) {
            break;
        }
    }

    tracing::debug!(client_id = %shared.client_id, "supervisor stopped");
}

/// Replace a dead link. Returns false when the session is done, either
/// because it is closing or because every attempt failed.
fn reconnect(shared: &Arc<Shared>, shutdown: &Receiver<()>, lost: &Receiver<()>) -> bool {
    shared.set_status(SessionStatus::Connecting);
    shared.release_link();
    tracing::warn!(client_id = %shared.client_id, "connection lost, reconnecting");
    shared.events.emit(SessionEvent::Disconnected);

    let policy = &shared.options.reconnect;
    for attempt in 0..policy.max_attempts {
        match shutdown.recv_timeout(policy.delay_for(attempt)) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return false,
        }

        let link = match shared.establish() {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(
                    client_id = %shared.client_id,
                    attempt = attempt + 1,
                    error = %e,
                    "reconnect attempt failed"
                );
                continue;
            }
        };
        if !shared.install(Arc::clone(&link)) {
            return false;
        }
        // Stale signals from the old link.
        while lost.try_recv().is_ok() {}

        let (resumed_durables, restarted) = resubscribe(shared, &link);
        resend_unacked(shared, &link);

        if shared.is_closed() {
            return false;
        }
        shared.set_status(SessionStatus::Open);
        tracing::info!(
            client_id = %shared.client_id,
            attempt = attempt + 1,
            resumed_durables,
            restarted,
            "reconnected"
        );
        shared.events.emit(SessionEvent::Reconnected {
            resumed_durables,
            restarted,
        });
        return true;
    }

    tracing::warn!(
        client_id = %shared.client_id,
        attempts = policy.max_attempts,
        "reconnect attempts exhausted"
    );
    shared
        .events
        .emit(SessionEvent::ConnectionLost(ConnectionError::LostConnection));
    shared.shutdown(false);
    false
}

/// Register every active subscription on the new link.
///
/// Durables resume from the broker's cursor. Everything else restarts at
/// new messages, so what was published while disconnected is skipped.
/// Returns (resumed durables, restarted others).
fn resubscribe(shared: &Shared, link: &Arc<dyn Link>) -> (usize, usize) {
    let mut waiting: HashMap<u64, Arc<SubscriptionEntry>> = HashMap::new();
    for entry in shared.subscriptions.active() {
        let request_id = shared.next_request_id();
        let start = if entry.is_durable() {
            entry.options.start
        } else {
            StartPosition::NewOnly
        };
        match link.send(entry.subscribe_frame(request_id, start)) {
            Ok(()) => {
                waiting.insert(request_id, entry);
            }
            // The link died again; the next reconnect retries.
            Err(_) => return (0, 0),
        }
    }

    // Replies are read here since this thread is the one that routes
    // them; everything else goes through the normal path.
    let inbound = link.inbound();
    let deadline = Instant::now() + shared.options.request_timeout;
    let mut resumed_durables = 0;
    let mut restarted = 0;
    while !waiting.is_empty() {
        match inbound.recv_deadline(deadline) {
            Ok(ServerFrame::SubscribeReply { request_id, error }) if waiting.contains_key(&request_id) => {
                let Some(entry) = waiting.remove(&request_id) else {
                    continue;
                };
                match error {
                    None if entry.is_durable() => resumed_durables += 1,
                    None => restarted += 1,
                    Some(rejection) => {
                        resubscribe_failed(shared, &entry, SubscribeError::from(rejection).to_string())
                    }
                }
            }
            Ok(frame) => shared.route(frame),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                shared.signal_lost();
                return (resumed_durables, restarted);
            }
        }
    }

    for entry in waiting.into_values() {
        resubscribe_failed(shared, &entry, "timed out waiting for the broker".to_string());
    }
    (resumed_durables, restarted)
}

fn resubscribe_failed(shared: &Shared, entry: &SubscriptionEntry, error: String) {
    tracing::warn!(
        client_id = %shared.client_id,
        subscription = %entry.id,
        subject = %entry.subject,
        %error,
        "resubscribe failed"
    );
    // No join: a handler may be waiting on a frame only this thread routes.
    entry.transition(SubscriptionState::Closed);
    entry.halt();
    shared.subscriptions.remove(entry.id);
    shared.events.emit(SessionEvent::ResubscribeFailed {
        subscription: entry.id,
        error,
    });
}

/// Re-send publishes still waiting for an ack, keeping their guids.
fn resend_unacked(shared: &Shared, link: &Arc<dyn Link>) {
    let unacked = shared.acks.unacked();
    if unacked.is_empty() {
        return;
    }
    tracing::debug!(client_id = %shared.client_id, count = unacked.len(), "re-sending unacknowledged publishes");

    for (guid, subject, payload) in unacked {
        if let Err(e) = link.send(ClientFrame::Publish {
            guid,
            subject,
            payload,
        }) {
            tracing::debug!(guid, error = %e, "re-send failed");
            shared.signal_lost();
            return;
        }
    }
}

/// Heartbeats and async ack expiry.
pub(super) fn housekeeping(shared: Arc<Shared>, shutdown: Receiver<()>) {
    let interval = shared.options.ping_interval;
    let tick = interval.min(HOUSEKEEPING_TICK);
    let mut last_ping = Instant::now();
    let mut ping_id = 0u64;

    loop {
        match shutdown.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        let now = Instant::now();
        shared.acks.expire(now);

        if shared.status() != SessionStatus::Open || now.duration_since(last_ping) < interval {
            continue;
        }
        last_ping = now;

        let outstanding = shared.pings_outstanding.load(Ordering::SeqCst);
        if outstanding >= shared.options.max_pings_outstanding {
            tracing::warn!(
                client_id = %shared.client_id,
                outstanding,
                "heartbeats unanswered, treating connection as lost"
            );
            shared.pings_outstanding.store(0, Ordering::SeqCst);
            shared.signal_lost();
            continue;
        }

        shared.pings_outstanding.fetch_add(1, Ordering::SeqCst);
        ping_id += 1;
        if let Err(e) = shared.send(ClientFrame::Ping { id: ping_id }) {
            tracing::trace!(client_id = %shared.client_id, error = %e, "ping not sent");
        }
    }

    tracing::debug!(client_id = %shared.client_id, "housekeeping stopped");
}
