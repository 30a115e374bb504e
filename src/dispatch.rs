//! Per-subscription dispatch loop.
//!
//! Each subscription owns one thread that pulls its messages off a
//! private queue and runs the handler on them one at a time, in arrival
//! order. The broker sends a subscription's messages in sequence order,
//! so handlers observe per-subject order.
//!
//! ```text
//! Idle --message--> Delivering --handler returns--> Idle
//!   \                                                 |
//!    +------------- stop / session close ------------> Stopped
//! ```
//!
//! A handler failure (error or panic) never ends the loop. It is reported
//! as [`SessionEvent::CallbackFailed`]; whether the message is still
//! acknowledged depends on the subscription's [`AckPolicy`].

use crate::error::CallbackError;
use crate::events::SessionEvent;
use crate::subscriptions::{AckPolicy, SubscriptionId};
use crate::types::{Message, Sequence};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handler invoked for each delivered message.
pub type MessageHandler = Box<dyn FnMut(&Message) -> Result<(), CallbackError> + Send>;

/// Dispatch loop state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Delivering,
    Stopped,
}

/// Counters for one subscription's dispatch loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Handler invocations, redeliveries included.
    pub delivered: u64,
    pub acked: u64,
    pub failed: u64,
    pub last_sequence: Option<Sequence>,
}

/// Where dispatch loops send acks and failure reports.
pub(crate) trait DispatchSink: Send + Sync + 'static {
    fn ack(&self, subscription: SubscriptionId, message: &Message);

    fn report(&self, event: SessionEvent);
}

struct Status {
    state: DispatchState,
    stats: DispatchStats,
}

/// Handle to a running dispatch loop.
pub(crate) struct DispatchLoop {
    queue: Sender<Message>,
    stop: Mutex<Option<Sender<()>>>,
    stopped: Arc<AtomicBool>,
    status: Arc<Mutex<Status>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchLoop {
    /// Start the loop thread for a subscription.
    pub(crate) fn spawn(
        id: SubscriptionId,
        handler: MessageHandler,
        policy: AckPolicy,
        sink: Arc<dyn DispatchSink>,
    ) -> std::io::Result<Self> {
        let (queue, queue_rx) = unbounded();
        let (stop, stop_rx) = unbounded();
        let stopped = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(Status {
            state: DispatchState::Idle,
            stats: DispatchStats::default(),
        }));

        let worker = Worker {
            id,
            handler,
            policy,
            sink,
            stopped: Arc::clone(&stopped),
            status: Arc::clone(&status),
        };
        let handle = thread::Builder::new()
            .name(format!("courier-dispatch-{}", id))
            .spawn(move || worker.run(queue_rx, stop_rx))?;

        Ok(Self {
            queue,
            stop: Mutex::new(Some(stop)),
            stopped,
            status,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a message. Returns false once the loop has stopped.
    pub(crate) fn enqueue(&self, message: Message) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.queue.send(message).is_ok()
    }

    /// Ask the loop to stop after the current handler call, if any.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.lock().take();
    }

    /// Wait for the loop thread to exit. No-op from inside a handler.
    pub(crate) fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("dispatch thread panicked");
            }
        }
    }

    pub(crate) fn state(&self) -> DispatchState {
        self.status.lock().state
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        self.status.lock().stats
    }
}

struct Worker {
    id: SubscriptionId,
    handler: MessageHandler,
    policy: AckPolicy,
    sink: Arc<dyn DispatchSink>,
    stopped: Arc<AtomicBool>,
    status: Arc<Mutex<Status>>,
}

impl Worker {
    fn run(mut self, queue: Receiver<Message>, stop: Receiver<()>) {
        loop {
            let message = select! {
                recv(stop) -> _ => break,
                recv(queue) -> message => match message {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            // select! picks randomly when both are ready.
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.deliver(message);
        }

        self.status.lock().state = DispatchState::Stopped;
        tracing::debug!(subscription = %self.id, "dispatch loop stopped");
    }

    fn deliver(&mut self, message: Message) {
        self.status.lock().state = DispatchState::Delivering;

        let handler = &mut self.handler;
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| handler(&message))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        // Unacked messages are redelivered, so a stop that landed during
        // the handler call withholds the ack.
        let ack = (failure.is_none() || self.policy == AckPolicy::Always)
            && !self.stopped.load(Ordering::SeqCst);
        if ack {
            self.sink.ack(self.id, &message);
        }

        {
            let mut status = self.status.lock();
            status.stats.delivered += 1;
            status.stats.last_sequence = Some(message.sequence);
            if ack {
                status.stats.acked += 1;
            }
            if failure.is_some() {
                status.stats.failed += 1;
            }
            status.state = DispatchState::Idle;
        }

        if let Some(error) = failure {
            tracing::warn!(
                subscription = %self.id,
                subject = %message.subject,
                sequence = %message.sequence,
                %error,
                acked = ack,
                "subscription handler failed"
            );
            self.sink.report(SessionEvent::CallbackFailed {
                subscription: self.id,
                subject: message.subject,
                sequence: message.sequence,
                error,
                acked: ack,
            });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
