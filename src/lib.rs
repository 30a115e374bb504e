//! # Courier
//!
//! Client core for durable, at-least-once publish/subscribe messaging.
//!
//! ## Core Concepts
//!
//! - **Connection**: one session (cluster id, client id, endpoint) with
//!   heartbeats and automatic reconnect
//! - **Publisher**: publishes with broker acknowledgment, blocking or
//!   callback-based
//! - **Subscriptions**: handlers on subject patterns, optionally durable or
//!   load-balanced in a queue group
//! - **Dispatch**: one sequential delivery loop per subscription; handler
//!   failures are reported, never fatal
//!
//! Delivery is at-least-once: handlers may see a message again after a
//! crash, an unsubscribe or an ack timeout, and should dedupe on
//! [`Message::sequence`].
//!
//! ## Example
//!
//! ```ignore
//! use courier::{BrokerConfig, Connection, ConnectionOptions, MemoryBroker, SubscriptionOptions};
//! use std::time::Duration;
//!
//! let broker = MemoryBroker::new(BrokerConfig::default());
//! let conn = Connection::connect(broker, "test-cluster", "client-1", ConnectionOptions::default())?;
//!
//! let sub = conn.subscribe("foo", SubscriptionOptions::default(), |msg| {
//!     println!("Received: {:?}", msg.text());
//!     Ok(())
//! })?;
//!
//! let seq = conn.publisher().publish_sync("foo", "Hello World", Duration::from_secs(2))?;
//!
//! sub.unsubscribe()?;
//! conn.close();
//! ```

pub mod broker;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod publisher;
pub mod subject;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use broker::{BrokerConfig, MemoryBroker};
pub use connection::{Connection, ConnectionOptions, ReconnectPolicy};
pub use dispatch::{DispatchState, DispatchStats, MessageHandler};
pub use error::{
    CallbackError, ConnectionError, Error, PublishError, Result, SubscribeError,
};
pub use events::SessionEvent;
pub use publisher::{AckHandle, AckResult, Publisher};
pub use subscriptions::{
    AckPolicy, Subscription, SubscriptionId, SubscriptionManager, SubscriptionOptions,
    SubscriptionState,
};
pub use transport::{ClientFrame, Link, ServerFrame, Transport};
pub use types::*;
