//! Session lifecycle.
//!
//! A [`Connection`] owns exactly one session with the broker. It keeps
//! three background threads:
//!
//! - **supervisor**: reads frames off the link and routes them (acks to
//!   the publish table, deliveries to subscriptions, replies to waiting
//!   requests); on transport loss it runs the reconnect loop
//! - **housekeeping**: heartbeats and async publish-ack expiry
//! - **acks**: runs async publish callbacks
//!
//! Publishers and subscriptions share the link but never change its
//! lifecycle; only `close` (or exhausting reconnects) does, and the link
//! is released exactly once.
//!
//! # Example
//!
//! ```ignore
//! let broker = MemoryBroker::new(BrokerConfig::default());
//! let conn = Connection::connect(broker, "test-cluster", "client-1", ConnectionOptions::default())?;
//!
//! let seq = conn.publish("foo", "Hello World")?;
//! conn.close();
//! ```

mod options;
mod supervisor;

pub use options::{ConnectionOptions, ReconnectPolicy};

use crate::dispatch::DispatchSink;
use crate::error::{CallbackError, ConnectionError, PublishError, SubscribeError};
use crate::events::{EventBus, SessionEvent};
use crate::publisher::{self, PendingAcks, Publisher};
use crate::subscriptions::{Subscription, SubscriptionId, SubscriptionManager, SubscriptionOptions};
use crate::transport::{ClientFrame, ConnectRejection, Link, ServerFrame, Transport};
use crate::types::{Message, Sequence, SessionInfo, SessionStatus};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Requests waiting for their reply frame.
#[derive(Default)]
struct Requests {
    waiting: HashMap<u64, Sender<ServerFrame>>,
    closed: bool,
}

/// Background threads and the channel that stops them.
struct Control {
    /// Dropped to signal shutdown.
    shutdown: Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

/// State shared by the connection, its publishers, subscriptions and
/// background threads.
pub(crate) struct Shared {
    pub(crate) cluster_id: String,
    pub(crate) client_id: String,
    pub(crate) options: ConnectionOptions,
    transport: Box<dyn Transport>,
    status: RwLock<SessionStatus>,
    link: RwLock<Option<Arc<dyn Link>>>,
    max_payload: AtomicUsize,
    pub(crate) acks: PendingAcks,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) events: EventBus,
    requests: Mutex<Requests>,
    next_request: AtomicU64,
    pings_outstanding: AtomicU32,
    closed: AtomicBool,
    /// Raised when a send or heartbeat finds the transport dead.
    lost: Sender<()>,
    control: Mutex<Option<Control>>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::SeqCst)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::SeqCst)
    }

    fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.link.read().clone()
    }

    /// Tell the supervisor the transport looks dead.
    fn signal_lost(&self) {
        let _ = self.lost.try_send(());
    }

    /// Send a frame on the current link.
    pub(crate) fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        let Some(link) = self.current_link() else {
            return Err(if self.is_closed() {
                ConnectionError::Closed
            } else {
                ConnectionError::LostConnection
            });
        };
        let result = link.send(frame);
        if let Err(ConnectionError::LostConnection) = &result {
            self.signal_lost();
        }
        result
    }

    /// Send a publish frame. Failures are only logged: the entry stays in
    /// the ack table and is re-sent after a reconnect.
    pub(crate) fn send_publish(&self, guid: u64, subject: &str, payload: Vec<u8>) {
        let frame = ClientFrame::Publish {
            guid,
            subject: subject.to_string(),
            payload,
        };
        if let Err(e) = self.send(frame) {
            tracing::debug!(guid, %subject, error = %e, "publish not sent, will retry after reconnect");
        }
    }

    /// Send a request frame built around a fresh request id and wait for
    /// the matching reply.
    pub(crate) fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
        timeout: std::time::Duration,
    ) -> Result<ServerFrame, ConnectionError> {
        let request_id = self.next_request_id();
        let (reply_tx, reply_rx) = bounded(1);
        {
            let mut requests = self.requests.lock();
            if requests.closed {
                return Err(ConnectionError::Closed);
            }
            requests.waiting.insert(request_id, reply_tx);
        }

        let result = self
            .send(build(request_id))
            .and_then(|()| match reply_rx.recv_timeout(timeout) {
                Ok(frame) => Ok(frame),
                Err(RecvTimeoutError::Timeout) => Err(ConnectionError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(ConnectionError::Closed),
            });

        self.requests.lock().waiting.remove(&request_id);
        result
    }

    /// Route one inbound frame.
    pub(crate) fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::PubAck { guid, result } => {
                let result = result.map_err(PublishError::Rejected);
                if !self.acks.resolve(guid, result) {
                    tracing::trace!(guid, "ack for unknown publish ignored");
                }
            }
            ServerFrame::Deliver { inbox, message } => {
                let subject = message.subject.clone();
                let sequence = message.sequence;
                if !self.subscriptions.deliver(inbox, message) {
                    tracing::trace!(subscription = %inbox, %subject, %sequence, "delivery for inactive subscription dropped");
                }
            }
            ServerFrame::Pong { .. } => {
                self.pings_outstanding.store(0, Ordering::SeqCst);
            }
            reply => {
                let Some(request_id) = reply.request_id() else {
                    return;
                };
                let waiter = self.requests.lock().waiting.remove(&request_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => tracing::trace!(request_id, "reply without a waiting request"),
                }
            }
        }
    }

    /// Dial and run the connect handshake.
    fn establish(&self) -> Result<Arc<dyn Link>, ConnectionError> {
        let deadline = Instant::now() + self.options.connect_timeout;
        let link = self
            .transport
            .dial(&self.options.endpoint_url, self.options.connect_timeout)?;

        let request_id = self.next_request_id();
        let result = link
            .send(ClientFrame::Connect {
                request_id,
                cluster_id: self.cluster_id.clone(),
                client_id: self.client_id.clone(),
                token: self.options.token.clone(),
            })
            .and_then(|()| self.await_connect_reply(&link, request_id, deadline));

        match result {
            Ok(max_payload) => {
                self.max_payload.store(max_payload, Ordering::SeqCst);
                Ok(link)
            }
            Err(e) => {
                link.close();
                Err(e)
            }
        }
    }

    fn await_connect_reply(
        &self,
        link: &Arc<dyn Link>,
        request_id: u64,
        deadline: Instant,
    ) -> Result<usize, ConnectionError> {
        let inbound = link.inbound();
        loop {
            match inbound.recv_deadline(deadline) {
                Ok(ServerFrame::ConnectReply {
                    request_id: id,
                    result,
                }) if id == request_id => {
                    return result.map_err(|rejection| match rejection {
                        ConnectRejection::AuthFailed => ConnectionError::AuthFailed,
                        ConnectRejection::DuplicateClientId => ConnectionError::Refused(format!(
                            "client id '{}' is already connected",
                            self.client_id
                        )),
                        ConnectRejection::Other(reason) => ConnectionError::Refused(reason),
                    });
                }
                Ok(other) => tracing::trace!(frame = ?other, "frame before connect reply ignored"),
                Err(RecvTimeoutError::Timeout) => return Err(ConnectionError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(ConnectionError::LostConnection),
            }
        }
    }

    /// Make `link` current. Refused (and the link released) once closed.
    fn install(&self, link: Arc<dyn Link>) -> bool {
        let mut slot = self.link.write();
        if self.is_closed() {
            drop(slot);
            link.close();
            return false;
        }
        *slot = Some(link);
        self.pings_outstanding.store(0, Ordering::SeqCst);
        true
    }

    /// Release the current link, if any.
    fn release_link(&self) {
        let link = self.link.write().take();
        if let Some(link) = link {
            link.close();
        }
    }

    /// Tear the session down. Only the first call does anything.
    ///
    /// `notify_broker` is false when the transport is already gone.
    pub(crate) fn shutdown(&self, notify_broker: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(client_id = %self.client_id, "closing session");
        self.set_status(SessionStatus::Closing);

        // Before joining dispatch loops: a handler may be blocked on an ack.
        self.acks.fail_all(PublishError::ConnectionClosed);
        self.acks.stop_dispatcher();

        let stopped = self.subscriptions.close_all();
        tracing::debug!(client_id = %self.client_id, subscriptions = stopped, "subscriptions closed");

        if notify_broker {
            let reply = self.request(
                |request_id| ClientFrame::Close { request_id },
                self.options.request_timeout,
            );
            if let Err(e) = reply {
                tracing::debug!(client_id = %self.client_id, error = %e, "close request failed");
            }
        }

        self.release_link();
        {
            let mut requests = self.requests.lock();
            requests.closed = true;
            requests.waiting.clear();
        }

        let control = self.control.lock().take();
        if let Some(control) = control {
            drop(control.shutdown);
            let current = thread::current().id();
            for worker in control.workers {
                if worker.thread().id() != current && worker.join().is_err() {
                    tracing::warn!(client_id = %self.client_id, "session thread panicked");
                }
            }
        }

        self.set_status(SessionStatus::Closed);
        self.events.emit(SessionEvent::Closed);
        self.events.close();
        tracing::info!(client_id = %self.client_id, "session closed");
    }
}

impl DispatchSink for Shared {
    fn ack(&self, subscription: SubscriptionId, message: &Message) {
        let frame = ClientFrame::Ack {
            inbox: subscription,
            subject: message.subject.clone(),
            sequence: message.sequence,
        };
        if let Err(e) = self.send(frame) {
            tracing::debug!(
                subscription = %subscription,
                sequence = %message.sequence,
                error = %e,
                "ack not sent, message will be redelivered"
            );
        }
    }

    fn report(&self, event: SessionEvent) {
        self.events.emit(event);
    }
}

/// A session with the broker.
///
/// Dropping the connection closes it.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Open a session.
    ///
    /// Fails with `Timeout` if the broker does not answer within
    /// `connect_timeout`, `Refused` if it cannot be reached or the client
    /// id is taken, and `AuthFailed` if the token is rejected.
    pub fn connect<T: Transport>(
        transport: T,
        cluster_id: impl Into<String>,
        client_id: impl Into<String>,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let cluster_id = cluster_id.into();
        let client_id = client_id.into();
        options.validate()?;
        options::validate_client_id(&client_id)?;
        if cluster_id.is_empty() {
            return Err(ConnectionError::InvalidOptions(
                "cluster id must not be empty".to_string(),
            ));
        }

        let (acks, ack_jobs) = PendingAcks::new(options.max_pub_acks_inflight);
        let (lost_tx, lost_rx) = bounded(1);
        let events = EventBus::new(options.event_buffer);

        let shared = Arc::new(Shared {
            cluster_id,
            client_id,
            options,
            transport: Box::new(transport),
            status: RwLock::new(SessionStatus::Connecting),
            link: RwLock::new(None),
            max_payload: AtomicUsize::new(0),
            acks,
            subscriptions: SubscriptionManager::new(),
            events,
            requests: Mutex::new(Requests::default()),
            next_request: AtomicU64::new(1),
            pings_outstanding: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            lost: lost_tx,
            control: Mutex::new(None),
        });

        let link = shared.establish().map_err(|e| {
            tracing::debug!(client_id = %shared.client_id, error = %e, "connect failed");
            shared.set_status(SessionStatus::Closed);
            e
        })?;
        shared.install(link);
        shared.set_status(SessionStatus::Open);

        {
            // Held until the workers are registered so a shutdown started
            // by the supervisor still finds them.
            let mut control = shared.control.lock();
            let (shutdown_tx, shutdown_rx) = unbounded();
            match spawn_workers(&shared, shutdown_rx, lost_rx, ack_jobs) {
                Ok(workers) => {
                    *control = Some(Control {
                        shutdown: shutdown_tx,
                        workers,
                    });
                }
                Err(e) => {
                    drop(shutdown_tx);
                    drop(control);
                    shared.shutdown(false);
                    return Err(ConnectionError::Spawn(e.to_string()));
                }
            }
        }

        tracing::info!(
            cluster_id = %shared.cluster_id,
            client_id = %shared.client_id,
            endpoint = %shared.options.endpoint_url,
            "session open"
        );

        Ok(Self { shared })
    }

    pub fn session(&self) -> SessionInfo {
        SessionInfo {
            cluster_id: self.shared.cluster_id.clone(),
            client_id: self.shared.client_id.clone(),
            endpoint: self.shared.options.endpoint_url.clone(),
            status: self.shared.status(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    /// Largest payload the broker accepts, as advertised at connect.
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload()
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.shared))
    }

    /// Publish and wait up to `pub_ack_wait` for the ack.
    pub fn publish(
        &self,
        subject: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Sequence, PublishError> {
        self.publisher()
            .publish_sync(subject, payload, self.shared.options.pub_ack_wait)
    }

    /// Register `handler` for messages on `subject`.
    ///
    /// The handler runs on the subscription's own thread, one message at a
    /// time. Returning an error (or panicking) reports
    /// [`SessionEvent::CallbackFailed`]; the options' ack policy decides
    /// whether the message is redelivered.
    pub fn subscribe<F>(
        &self,
        subject: &str,
        options: SubscriptionOptions,
        handler: F,
    ) -> Result<Subscription, SubscribeError>
    where
        F: FnMut(&Message) -> Result<(), CallbackError> + Send + 'static,
    {
        Subscription::register(&self.shared, subject, options, Box::new(handler))
    }

    /// New receiver for session events.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.shared.events.listen()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.shared.subscriptions
    }

    /// Close the session. Subscriptions stop after their current handler
    /// call, and publishes still waiting for an ack fail with
    /// `ConnectionClosed`. Further calls do nothing.
    pub fn close(&self) {
        self.shared.shutdown(true);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown(true);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("cluster_id", &self.shared.cluster_id)
            .field("client_id", &self.shared.client_id)
            .field("status", &self.shared.status())
            .finish()
    }
}

fn spawn_workers(
    shared: &Arc<Shared>,
    shutdown: Receiver<()>,
    lost: Receiver<()>,
    ack_jobs: Receiver<publisher::AckJob>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut workers = Vec::with_capacity(3);
    workers.push(publisher::spawn_ack_dispatcher(&shared.client_id, ack_jobs)?);

    let supervisor_shared = Arc::clone(shared);
    let supervisor_shutdown = shutdown.clone();
    workers.push(
        thread::Builder::new()
            .name(format!("courier-supervisor-{}", shared.client_id))
            .spawn(move || supervisor::run(supervisor_shared, supervisor_shutdown, lost))?,
    );

    let housekeeping_shared = Arc::clone(shared);
    workers.push(
        thread::Builder::new()
            .name(format!("courier-housekeeping-{}", shared.client_id))
            .spawn(move || supervisor::housekeeping(housekeeping_shared, shutdown))?,
    );

    Ok(workers)
}
