//! Connection configuration.

use std::time::Duration;

use crate::core::DEFAULT_HANDSHAKE_TIMEOUT;

/// Duplex connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on the whole handshake, including the final frames.
    pub handshake_timeout: Duration,

    /// Capacity of the registry's event channel.
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            event_capacity: 64,
        }
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the registry event channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}
