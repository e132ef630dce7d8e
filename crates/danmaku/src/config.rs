//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection policy applied when an established connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnects attempted before the session is given up
    pub max_attempts: u32,
    /// Fixed wait before each reconnect
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 3000,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Settings for [`LiveClient`](crate::LiveClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Period of the socket heartbeat and the HTTP heartbeat ping
    pub heartbeat_interval_secs: u64,
    /// How long the first connection waits for the handshake reply
    pub handshake_timeout_secs: u64,
    /// Timeout applied to each HTTP call
    pub http_timeout_secs: u64,
    /// Capacity of the status broadcast channel
    pub event_buffer: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            handshake_timeout_secs: 10,
            http_timeout_secs: 10,
            event_buffer: 256,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl LiveConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.delay(), Duration::from_millis(3000));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: LiveConfig =
            serde_json::from_str(r#"{"heartbeat_interval_secs":15,"reconnect":{"max_attempts":2}}"#)
                .unwrap();
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.delay_ms, 3000);
    }
}
