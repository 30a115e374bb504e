//! Protocol frames exchanged between client and broker.

use crate::subscriptions::SubscriptionId;
use crate::types::{Message, Sequence, StartPosition};
use serde::{Deserialize, Serialize};

/// Frames sent by the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        request_id: u64,
        cluster_id: String,
        client_id: String,
        token: Option<String>,
    },

    Publish {
        /// Client-assigned id echoed in the ack.
        guid: u64,
        subject: String,
        payload: Vec<u8>,
    },

    Subscribe {
        request_id: u64,
        inbox: SubscriptionId,
        subject: String,
        queue_group: Option<String>,
        durable_name: Option<String>,
        start: StartPosition,
        max_inflight: usize,
        ack_wait_ms: u64,
    },

    /// Detach a subscription. The naming fields let the broker find a
    /// retained durable that no longer has a live member.
    Unsubscribe {
        request_id: u64,
        inbox: SubscriptionId,
        subject: String,
        queue_group: Option<String>,
        durable_name: Option<String>,
        close_durable: bool,
    },

    Ack {
        inbox: SubscriptionId,
        subject: String,
        sequence: Sequence,
    },

    Ping {
        id: u64,
    },

    Close {
        request_id: u64,
    },
}

/// Why the broker refused a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectRejection {
    AuthFailed,
    DuplicateClientId,
    Other(String),
}

/// Why the broker refused a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeRejection {
    SubjectInvalid(String),
    DuplicateDurable(String),
    Other(String),
}

/// Frames sent by the broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectReply {
        request_id: u64,
        /// Broker payload limit, or the rejection.
        result: Result<usize, ConnectRejection>,
    },

    PubAck {
        guid: u64,
        result: Result<Sequence, String>,
    },

    SubscribeReply {
        request_id: u64,
        error: Option<SubscribeRejection>,
    },

    UnsubscribeReply {
        request_id: u64,
        error: Option<String>,
    },

    Deliver {
        inbox: SubscriptionId,
        message: Message,
    },

    Pong {
        id: u64,
    },

    CloseReply {
        request_id: u64,
    },
}

impl ServerFrame {
    /// Request id for reply frames.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerFrame::ConnectReply { request_id, .. }
            | ServerFrame::SubscribeReply { request_id, .. }
            | ServerFrame::UnsubscribeReply { request_id, .. }
            | ServerFrame::CloseReply { request_id } => Some(*request_id),
            _ => None,
        }
    }
}
