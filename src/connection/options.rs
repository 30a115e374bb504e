//! Session configuration.

use crate::error::ConnectionError;
use std::time::Duration;

/// Exponential backoff for reconnect attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts before the session gives up (0 = never reconnect).
    /// Default: 5
    pub max_attempts: u32,

    /// Delay before the first attempt.
    /// Default: 100ms
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    /// Default: 5s
    pub max_delay: Duration,

    /// Growth factor between attempts.
    /// Default: 2.0
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Fail the session on the first transport loss.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

/// Options for a session.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Broker endpoint handed to the transport.
    /// Default: "nats://127.0.0.1:4222"
    pub endpoint_url: String,

    /// Time allowed for dialing plus the connect handshake.
    /// Default: 2s
    pub connect_timeout: Duration,

    /// How long a publish waits for its ack.
    /// Default: 30s
    pub pub_ack_wait: Duration,

    /// Max publishes awaiting an ack before publishing blocks.
    /// Default: 16384
    pub max_pub_acks_inflight: usize,

    /// Heartbeat interval.
    /// Default: 5s
    pub ping_interval: Duration,

    /// Unanswered heartbeats tolerated before the transport is
    /// considered lost.
    /// Default: 3
    pub max_pings_outstanding: u32,

    /// Time allowed for subscribe, unsubscribe and close requests.
    /// Default: 2s
    pub request_timeout: Duration,

    /// Per-listener buffer for session events.
    /// Default: 1000
    pub event_buffer: usize,

    /// Token presented to the broker.
    pub token: Option<String>,

    /// Reconnect behaviour after transport loss.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            endpoint_url: "nats://127.0.0.1:4222".to_string(),
            connect_timeout: Duration::from_secs(2),
            pub_ack_wait: Duration::from_secs(30),
            max_pub_acks_inflight: 16384,
            ping_interval: Duration::from_secs(5),
            max_pings_outstanding: 3,
            request_timeout: Duration::from_secs(2),
            event_buffer: 1000,
            token: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionOptions {
    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_pub_ack_wait(mut self, wait: Duration) -> Self {
        self.pub_ack_wait = wait;
        self
    }

    pub fn with_max_pub_acks_inflight(mut self, max: usize) -> Self {
        self.max_pub_acks_inflight = max;
        self
    }

    /// Heartbeat settings.
    pub fn with_pings(mut self, interval: Duration, max_outstanding: u32) -> Self {
        self.ping_interval = interval;
        self.max_pings_outstanding = max_outstanding;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        let invalid = |reason: &str| Err(ConnectionError::InvalidOptions(reason.to_string()));

        if self.endpoint_url.is_empty() {
            return invalid("endpoint_url must not be empty");
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("pub_ack_wait", self.pub_ack_wait),
            ("ping_interval", self.ping_interval),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConnectionError::InvalidOptions(format!(
                    "{} must be non-zero",
                    name
                )));
            }
        }
        if self.max_pub_acks_inflight == 0 {
            return invalid("max_pub_acks_inflight must be at least 1");
        }
        if self.max_pings_outstanding == 0 {
            return invalid("max_pings_outstanding must be at least 1");
        }
        if self.event_buffer == 0 {
            return invalid("event_buffer must be at least 1");
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return invalid("reconnect multiplier must be at least 1.0");
        }
        Ok(())
    }
}

/// Client ids are limited to ASCII letters, digits, `-` and `_`.
pub(crate) fn validate_client_id(client_id: &str) -> Result<(), ConnectionError> {
    if client_id.is_empty()
        || !client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConnectionError::InvalidOptions(format!(
            "invalid client id: '{}'",
            client_id
        )));
    }
    Ok(())
}
