//! Publishing with broker acknowledgment.
//!
//! Every publish is assigned a guid and parked in the [`PendingAcks`]
//! table until the broker's ack (or a failure) resolves it. Resolution
//! happens exactly once:
//!
//! - `publish_sync` waits on a private channel and gives up after its
//!   timeout with [`PublishError::AckTimeout`]
//! - `publish_async` hands its callback to the ack dispatcher thread,
//!   which runs callbacks one at a time in resolution order
//!
//! Unacknowledged entries survive a reconnect and are re-sent with their
//! original guid. Closing the session resolves whatever is left with
//! [`PublishError::ConnectionClosed`].

use crate::connection::Shared;
use crate::error::PublishError;
use crate::subject;
use crate::types::Sequence;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Outcome of one publish.
pub type AckResult = Result<Sequence, PublishError>;

type AckCallback = Box<dyn FnOnce(AckResult) + Send>;

/// A resolved async publish waiting for the dispatcher thread.
pub(crate) struct AckJob {
    guid: u64,
    callback: AckCallback,
    result: AckResult,
}

impl AckJob {
    fn run(self) {
        let guid = self.guid;
        let callback = self.callback;
        let result = self.result;
        if panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
            tracing::warn!(guid, "publish ack callback panicked");
        }
    }
}

enum Completion {
    Waiter(Sender<AckResult>),
    Callback(AckCallback),
}

struct PendingPublish {
    subject: String,
    payload: Vec<u8>,
    /// Async entries expire here; sync callers track their own timeout.
    deadline: Option<Instant>,
    completion: Completion,
}

#[derive(Default)]
struct AckTable {
    entries: BTreeMap<u64, PendingPublish>,
    next_guid: u64,
    closed: bool,
}

/// Publishes awaiting a broker ack, keyed by guid.
pub(crate) struct PendingAcks {
    table: Mutex<AckTable>,
    /// Signalled whenever an entry leaves the table.
    room: Condvar,
    limit: usize,
    dispatcher: Mutex<Option<Sender<AckJob>>>,
}

impl PendingAcks {
    /// Table plus the job queue the ack dispatcher thread drains.
    pub(crate) fn new(limit: usize) -> (Self, Receiver<AckJob>) {
        let (jobs, receiver) = unbounded();
        let acks = Self {
            table: Mutex::new(AckTable {
                next_guid: 1,
                ..Default::default()
            }),
            room: Condvar::new(),
            limit: limit.max(1),
            dispatcher: Mutex::new(Some(jobs)),
        };
        (acks, receiver)
    }

    /// Park a publish, waiting up to `wait` for room under the in-flight
    /// limit.
    fn register(
        &self,
        subject: &str,
        payload: Vec<u8>,
        completion: Completion,
        wait: Duration,
        deadline: Option<Instant>,
    ) -> Result<u64, PublishError> {
        let wait_until = Instant::now() + wait;
        let mut table = self.table.lock();
        loop {
            if table.closed {
                return Err(PublishError::ConnectionClosed);
            }
            if table.entries.len() < self.limit {
                break;
            }
            if self.room.wait_until(&mut table, wait_until).timed_out() {
                return Err(if table.closed {
                    PublishError::ConnectionClosed
                } else {
                    PublishError::InflightLimit
                });
            }
        }

        let guid = table.next_guid;
        table.next_guid += 1;
        table.entries.insert(
            guid,
            PendingPublish {
                subject: subject.to_string(),
                payload,
                deadline,
                completion,
            },
        );
        Ok(guid)
    }

    /// Resolve an entry. Returns false if it was already resolved.
    pub(crate) fn resolve(&self, guid: u64, result: AckResult) -> bool {
        let entry = self.table.lock().entries.remove(&guid);
        match entry {
            Some(entry) => {
                self.room.notify_one();
                self.complete(guid, entry.completion, result);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it.
    fn cancel(&self, guid: u64) -> bool {
        let removed = self.table.lock().entries.remove(&guid).is_some();
        if removed {
            self.room.notify_one();
        }
        removed
    }

    /// Resolve async entries whose deadline passed with `AckTimeout`.
    pub(crate) fn expire(&self, now: Instant) {
        let expired: Vec<(u64, PendingPublish)> = {
            let mut table = self.table.lock();
            let guids: Vec<u64> = table
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
                .map(|(guid, _)| *guid)
                .collect();
            guids
                .into_iter()
                .filter_map(|guid| table.entries.remove(&guid).map(|e| (guid, e)))
                .collect()
        };

        if !expired.is_empty() {
            self.room.notify_all();
        }
        for (guid, entry) in expired {
            tracing::debug!(guid, subject = %entry.subject, "publish ack expired");
            self.complete(guid, entry.completion, Err(PublishError::AckTimeout));
        }
    }

    /// Resolve everything with `error` and refuse further publishes.
    pub(crate) fn fail_all(&self, error: PublishError) {
        let entries = {
            let mut table = self.table.lock();
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        self.room.notify_all();

        for (guid, entry) in entries {
            self.complete(guid, entry.completion, Err(error.clone()));
        }
    }

    /// Let the dispatcher thread finish queued callbacks and exit.
    pub(crate) fn stop_dispatcher(&self) {
        self.dispatcher.lock().take();
    }

    /// Unacknowledged publishes in guid order, for re-sending.
    pub(crate) fn unacked(&self) -> Vec<(u64, String, Vec<u8>)> {
        self.table
            .lock()
            .entries
            .iter()
            .map(|(guid, entry)| (*guid, entry.subject.clone(), entry.payload.clone()))
            .collect()
    }

    pub(crate) fn is_pending(&self, guid: u64) -> bool {
        self.table.lock().entries.contains_key(&guid)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    fn complete(&self, guid: u64, completion: Completion, result: AckResult) {
        match completion {
            Completion::Waiter(waiter) => {
                let _ = waiter.send(result);
            }
            Completion::Callback(callback) => {
                let job = AckJob {
                    guid,
                    callback,
                    result,
                };
                let queued = match self.dispatcher.lock().as_ref() {
                    Some(jobs) => jobs.send(job).map_err(|e| e.into_inner()),
                    None => Err(job),
                };
                // Dispatcher already gone: run it here rather than lose it.
                if let Err(job) = queued {
                    job.run();
                }
            }
        }
    }
}

/// Start the thread that runs async publish callbacks.
pub(crate) fn spawn_ack_dispatcher(
    client_id: &str,
    jobs: Receiver<AckJob>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("courier-acks-{}", client_id))
        .spawn(move || {
            for job in jobs.iter() {
                job.run();
            }
        })
}

/// Handle to an async publish.
#[derive(Clone)]
pub struct AckHandle {
    guid: u64,
    subject: String,
    shared: Arc<Shared>,
}

impl AckHandle {
    /// Publish id assigned by this session.
    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether the ack callback has yet to be scheduled.
    pub fn is_pending(&self) -> bool {
        self.shared.acks.is_pending(self.guid)
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("guid", &self.guid)
            .field("subject", &self.subject)
            .finish()
    }
}

/// Publishes messages through a session.
///
/// Cheap to clone; all clones share the session. Acks for one subject
/// arrive in the order that subject's messages were published.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Publish and block until the broker acks or `timeout` elapses.
    ///
    /// `AckTimeout` means the outcome is unknown: the message may have
    /// been stored.
    pub fn publish_sync(
        &self,
        subject: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Sequence, PublishError> {
        let payload = payload.into();
        self.check(subject, &payload)?;

        let started = Instant::now();
        let (waiter, outcome) = bounded(1);
        let guid = self.shared.acks.register(
            subject,
            payload.clone(),
            Completion::Waiter(waiter),
            timeout,
            None,
        )?;
        self.shared.send_publish(guid, subject, payload);

        let remaining = timeout.saturating_sub(started.elapsed());
        match outcome.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.acks.cancel(guid) {
                    tracing::debug!(guid, %subject, "publish ack timed out");
                    return Err(PublishError::AckTimeout);
                }
                // Resolved while we were giving up.
                outcome
                    .try_recv()
                    .unwrap_or(Err(PublishError::AckTimeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PublishError::ConnectionClosed),
        }
    }

    /// Publish without blocking for the ack.
    ///
    /// `on_ack` runs exactly once on the session's ack thread: with the
    /// sequence, a broker rejection, `AckTimeout` after `pub_ack_wait`,
    /// or `ConnectionClosed`. If this returns an error, `on_ack` is
    /// never called.
    pub fn publish_async<F>(
        &self,
        subject: &str,
        payload: impl Into<Vec<u8>>,
        on_ack: F,
    ) -> Result<AckHandle, PublishError>
    where
        F: FnOnce(AckResult) + Send + 'static,
    {
        let payload = payload.into();
        self.check(subject, &payload)?;

        let wait = self.shared.options.pub_ack_wait;
        let guid = self.shared.acks.register(
            subject,
            payload.clone(),
            Completion::Callback(Box::new(on_ack)),
            wait,
            Some(Instant::now() + wait),
        )?;
        self.shared.send_publish(guid, subject, payload);

        Ok(AckHandle {
            guid,
            subject: subject.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Serialize `value` as JSON and publish it synchronously.
    pub fn publish_json<T: Serialize>(
        &self,
        subject: &str,
        value: &T,
        timeout: Duration,
    ) -> Result<Sequence, PublishError> {
        let payload = serde_json::to_vec(value)?;
        self.publish_sync(subject, payload, timeout)
    }

    /// Publishes still waiting for an ack.
    pub fn pending(&self) -> usize {
        self.shared.acks.len()
    }

    fn check(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError> {
        if self.shared.is_closed() {
            return Err(PublishError::ConnectionClosed);
        }
        subject::validate_subject(subject).map_err(PublishError::SubjectInvalid)?;
        let max = self.shared.max_payload();
        if payload.len() > max {
            return Err(PublishError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("client_id", &self.shared.client_id)
            .finish()
    }
}
