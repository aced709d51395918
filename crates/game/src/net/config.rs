use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Socket read timeout; also how often receive loops notice shutdown.
    pub poll_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub connection_timeout_ms: u64,
    /// Datagrams kept for retransmission per peer.
    pub retransmit_capacity: usize,
    pub max_nack_range: u32,
    pub drop_probability: f32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 5,
            heartbeat_interval_ms: 1000,
            connection_timeout_ms: 10_000,
            retransmit_capacity: 4096,
            max_nack_range: 1024,
            drop_probability: 0.0,
        }
    }
}

impl TransportConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}
