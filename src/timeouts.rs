//! Timeout configuration for relay client operations.

use std::time::Duration;

/// Timeout configuration for relay client operations.
///
/// # Examples
///
/// ```rust
/// use relay_link::RelayTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = RelayTimeouts::default();
///
/// // Custom timeouts for high-latency environments
/// let timeouts = RelayTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .ack_timeout(Duration::from_secs(15))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct RelayTimeouts {
    /// Timeout for establishing the transport connection (TCP + TLS + upgrade).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Maximum wait for a server acknowledgment to a join-room or identify
    /// emit. Expiry surfaces as a failure response, not an error.
    /// Default: 10 seconds
    pub ack_timeout: Duration,

    /// Keep-alive ping interval for the default WebSocket transport.
    /// Set to 0 to disable keep-alive pings.
    /// Default: 20 seconds
    pub keepalive_interval: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
        }
    }
}

impl RelayTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> RelayTimeoutsBuilder {
        RelayTimeoutsBuilder::new()
    }

    /// Timeouts optimized for fast local development.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(10),
        }
    }

    /// Timeouts optimized for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
        }
    }

    /// Check if a duration represents "no timeout" (zero or absurdly large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for [`RelayTimeouts`].
#[derive(Debug, Clone)]
pub struct RelayTimeoutsBuilder {
    timeouts: RelayTimeouts,
}

impl RelayTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: RelayTimeouts::default(),
        }
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the server-acknowledgment timeout.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.ack_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval. Zero disables pings.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> RelayTimeouts {
        self.timeouts
    }
}
