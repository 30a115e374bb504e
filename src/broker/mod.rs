//! In-process broker.
//!
//! `MemoryBroker` implements [`Transport`] so a [`crate::Connection`] can
//! run against it without a network. It honours the broker-side half of
//! the protocol: per-subject sequences, durable cursors, queue groups,
//! in-flight limits and ack-wait redelivery. It also exposes fault
//! injection hooks used by the test suite.
//!
//! # Example
//!
//! ```ignore
//! let broker = MemoryBroker::new(BrokerConfig::default());
//! let conn = Connection::connect(broker.clone(), "test-cluster", "client-1", ConnectionOptions::default())?;
//! ```

mod state;

use crate::error::ConnectionError;
use crate::transport::{ClientFrame, Link, ServerFrame, Transport};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use state::{BrokerState, ConnId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Memory broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Cluster this broker answers for.
    /// Default: "test-cluster"
    pub cluster_id: String,

    /// Largest accepted payload in bytes.
    /// Default: 1MB
    pub max_payload: usize,

    /// Token clients must present (None = open).
    pub token: Option<String>,

    /// How often ack-wait expiry is checked.
    /// Default: 25ms
    pub redelivery_tick: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "test-cluster".to_string(),
            max_payload: 1024 * 1024, // 1MB
            token: None,
            redelivery_tick: Duration::from_millis(25),
        }
    }
}

struct BrokerInner {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    next_conn: AtomicU64,
    reachable: AtomicBool,
    responsive: AtomicBool,
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Start a broker and its redelivery sweeper.
    pub fn new(config: BrokerConfig) -> Self {
        let tick = config.redelivery_tick;
        let inner = Arc::new(BrokerInner {
            config,
            state: Mutex::new(BrokerState::default()),
            next_conn: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            responsive: AtomicBool::new(true),
        });

        Self::spawn_sweeper(Arc::downgrade(&inner), tick);

        Self { inner }
    }

    fn spawn_sweeper(inner: Weak<BrokerInner>, tick: Duration) {
        let spawned = thread::Builder::new()
            .name("courier-broker-redelivery".to_string())
            .spawn(move || loop {
                thread::sleep(tick);
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.state.lock().redeliver_expired(Instant::now());
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to start redelivery sweeper");
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// When false, dialing fails with `Refused`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// When false, every inbound frame is silently dropped, heartbeats
    /// included, as if the broker hung.
    pub fn set_responsive(&self, responsive: bool) {
        self.inner.responsive.store(responsive, Ordering::SeqCst);
    }

    /// When true, subscribe, unsubscribe and close requests are still
    /// applied but their replies never arrive, as if lost in transit.
    pub fn set_drop_replies(&self, drop_replies: bool) {
        self.inner.state.lock().set_drop_replies(drop_replies);
    }

    /// Drop the connection held by a client from the broker side.
    /// Returns false if the client is not connected.
    pub fn sever(&self, client_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.conn_for_client(client_id) {
            Some(conn) => {
                tracing::debug!(%client_id, conn, "severing connection");
                state.close_session(conn);
                true
            }
            None => false,
        }
    }

    /// Number of registered client ids.
    pub fn client_count(&self) -> usize {
        self.inner.state.lock().client_count()
    }

    /// Number of messages stored on a subject.
    pub fn message_count(&self, subject: &str) -> usize {
        self.inner.state.lock().message_count(subject)
    }

    /// Whether durable cursor state exists for the triple.
    pub fn has_durable(&self, client_id: &str, durable_name: &str, subject: &str) -> bool {
        self.inner
            .state
            .lock()
            .has_durable(client_id, durable_name, subject)
    }

    /// Deliveries awaiting an ack, across all subscriptions.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().inflight_count()
    }
}

impl Transport for MemoryBroker {
    fn dial(&self, endpoint: &str, _timeout: Duration) -> Result<Arc<dyn Link>, ConnectionError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Refused(format!(
                "{} is not reachable",
                endpoint
            )));
        }

        let conn = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = unbounded();
        self.inner.state.lock().open_session(conn, sender);
        tracing::trace!(%endpoint, conn, "dialed memory broker");

        Ok(Arc::new(MemoryLink {
            broker: Arc::clone(&self.inner),
            conn,
            inbound: receiver,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client end of a memory connection.
struct MemoryLink {
    broker: Arc<BrokerInner>,
    conn: ConnId,
    inbound: Receiver<ServerFrame>,
    closed: AtomicBool,
}

impl Link for MemoryLink {
    fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::LostConnection);
        }

        let mut state = self.broker.state.lock();
        if !state.is_open(self.conn) {
            return Err(ConnectionError::LostConnection);
        }
        if !self.broker.responsive.load(Ordering::SeqCst) {
            tracing::trace!(conn = self.conn, ?frame, "broker unresponsive, frame dropped");
            return Ok(());
        }
        state.handle(self.conn, frame, &self.broker.config);
        Ok(())
    }

    fn inbound(&self) -> Receiver<ServerFrame> {
        self.inbound.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.state.lock().close_session(self.conn);
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}
