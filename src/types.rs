//! Core types for the messaging client.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Broker-assigned position of a message within its subject.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A message as delivered to a subscription.
///
/// Immutable once delivered. Redeliveries carry the same subject and
/// sequence with `redelivered` set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    /// True if the broker has sent this message before.
    pub redelivered: bool,
}

impl Message {
    /// Payload as UTF-8 text, if it is valid.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Decode a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Handshake in progress, initially or while reconnecting.
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Where a new subscription starts reading.
///
/// Ignored when resuming an existing durable: the broker continues from
/// the durable's last acknowledged position instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StartPosition {
    /// Only messages published after the subscription is registered.
    #[default]
    NewOnly,
    /// The most recent message on each matching subject, then new ones.
    LastReceived,
    /// First message at or after this sequence.
    FromSequence(Sequence),
    /// First message stored at or after this time.
    FromTime(Timestamp),
    /// Everything the broker still holds.
    AllAvailable,
}

/// Snapshot of a session's identity and state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub cluster_id: String,
    pub client_id: String,
    pub endpoint: String,
    pub status: SessionStatus,
}
