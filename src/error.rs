//! Error types for the messaging client.

use thiserror::Error;

/// Errors raised while establishing or holding a session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Timed out waiting for the broker")]
    Timeout,

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Lost connection to the broker")]
    LostConnection,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Failed to start session thread: {0}")]
    Spawn(String),
}

/// Errors raised by publish operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The ack did not arrive in time. The message may still have been stored.
    #[error("Timed out waiting for publish ack (outcome unknown)")]
    AckTimeout,

    #[error("Payload of {size} bytes exceeds the broker maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid subject: {0}")]
    SubjectInvalid(String),

    #[error("Too many unacknowledged publishes in flight")]
    InflightLimit,

    #[error("Publish rejected by broker: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by subscribe and unsubscribe operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("Invalid subject: {0}")]
    SubjectInvalid(String),

    #[error("Durable subscription already active: {0}")]
    DuplicateDurable(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for the broker")]
    Timeout,

    #[error("Subscription rejected by broker: {0}")]
    Rejected(String),

    #[error("Invalid subscription options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Connection(ConnectionError),
}

impl From<ConnectionError> for SubscribeError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Closed => SubscribeError::ConnectionClosed,
            ConnectionError::Timeout => SubscribeError::Timeout,
            other => SubscribeError::Connection(other),
        }
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> Self {
        PublishError::Serialization(e.to_string())
    }
}

/// Failure returned (or panic raised) by a subscription handler.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Umbrella error for callers that mix operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
