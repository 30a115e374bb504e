//! Subscription types.

use crate::types::StartPosition;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default max unacknowledged deliveries outstanding to one subscription.
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

/// Default time the broker waits for an ack before redelivering.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Unique identifier for a subscription within a session.
///
/// Also serves as the private delivery inbox the broker addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    /// Delivery stopped; durable cursor (if any) retained by the broker.
    Unsubscribed,
    /// Delivery stopped by `close_durable` or session close.
    Closed,
}

/// What happens to a message whose handler fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Acknowledge regardless; the failure is only reported.
    #[default]
    Always,
    /// Withhold the ack so the broker redelivers after `ack_wait`.
    OnSuccess,
}

/// Options for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// Share delivery with other members of this group.
    pub queue_group: Option<String>,

    /// Persist the delivery cursor under this name.
    pub durable_name: Option<String>,

    /// Starting point for a fresh subscription.
    /// Default: NewOnly
    pub start: StartPosition,

    /// Handler-failure policy.
    /// Default: Always
    pub ack_policy: AckPolicy,

    /// Max unacknowledged messages in flight.
    /// Default: 1024
    pub max_inflight: usize,

    /// Redelivery interval for unacknowledged messages.
    /// Default: 30s
    pub ack_wait: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            queue_group: None,
            durable_name: None,
            start: StartPosition::NewOnly,
            ack_policy: AckPolicy::Always,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }
}

impl SubscriptionOptions {
    /// Durable subscription with the given name.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Queue-group member.
    pub fn queue(group: impl Into<String>) -> Self {
        Self {
            queue_group: Some(group.into()),
            ..Default::default()
        }
    }

    pub fn with_durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Check names and limits before contacting the broker.
    pub fn validate(&self) -> Result<(), String> {
        for (what, name) in [
            ("durable name", &self.durable_name),
            ("queue group", &self.queue_group),
        ] {
            if let Some(name) = name {
                if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '.') {
                    return Err(format!("invalid {}: '{}'", what, name));
                }
            }
        }
        if self.max_inflight == 0 {
            return Err("max_inflight must be at least 1".to_string());
        }
        if self.ack_wait.is_zero() {
            return Err("ack_wait must be non-zero".to_string());
        }
        Ok(())
    }
}
