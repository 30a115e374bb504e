//! Connection-oriented channel to the broker.
//!
//! The client core never encodes bytes itself. A [`Transport`] dials an
//! endpoint and yields a [`Link`]: an ordered, bidirectional pipe of
//! typed frames. Frames derive `serde` traits so a network transport can
//! pick any encoding. [`crate::broker::MemoryBroker`] is the in-process
//! implementation.

mod frames;

pub use frames::{ClientFrame, ConnectRejection, ServerFrame, SubscribeRejection};

use crate::error::ConnectionError;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// Dials broker endpoints.
pub trait Transport: Send + Sync + 'static {
    /// Open a new link. Fails with `Refused` when nothing is listening
    /// and `Timeout` when the endpoint does not answer in time.
    fn dial(&self, endpoint: &str, timeout: Duration) -> Result<Arc<dyn Link>, ConnectionError>;
}

/// One open channel to the broker.
///
/// Frames are delivered in the order they were sent, in both directions.
pub trait Link: Send + Sync {
    /// Send a frame. Fails with `LostConnection` once the link is down.
    fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError>;

    /// Frames from the broker. Disconnects when the link goes down.
    fn inbound(&self) -> Receiver<ServerFrame>;

    /// Release the link. Safe to call more than once.
    fn close(&self);
}
