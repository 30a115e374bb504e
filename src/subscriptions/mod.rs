//! Subscriptions: registering handlers against subjects.
//!
//! A subscription names a subject pattern and, optionally:
//! - a queue group, so the broker spreads messages across members
//! - a durable name, so the broker keeps the delivery cursor across
//!   unsubscribe and reconnect
//!
//! Each subscription gets its own dispatch loop; see [`crate::dispatch`].
//!
//! # Example
//!
//! ```ignore
//! let sub = conn.subscribe("orders", SubscriptionOptions::durable("worker-1"), |msg| {
//!     println!("seq {}: {:?}", msg.sequence, msg.text());
//!     Ok(())
//! })?;
//!
//! // Later: stop, keeping the cursor for the next run
//! sub.unsubscribe()?;
//! ```

mod manager;
mod subscription;
mod types;

pub use manager::SubscriptionManager;
pub use subscription::Subscription;
pub use types::{
    AckPolicy, SubscriptionId, SubscriptionOptions, SubscriptionState, DEFAULT_ACK_WAIT,
    DEFAULT_MAX_INFLIGHT,
};

pub(crate) use manager::SubscriptionEntry;
