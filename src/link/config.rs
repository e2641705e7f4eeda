use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::LINK_PORT;

/// UDP port the LAN advertiser broadcasts on.
pub const DISCOVERY_PORT: u16 = 8889;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// TCP port for hosting and the default port for joining. `0` binds an
    /// ephemeral port when hosting.
    pub port: u16,
    pub discovery_port: u16,
    pub advertise: bool,
    pub connect_timeout_ms: u64,
    /// `0` disables heartbeats.
    pub heartbeat_interval_ms: u64,
    /// A connection that hears nothing for this long fails. `0` disables.
    pub peer_timeout_ms: u64,
    pub send_queue_len: usize,
    pub event_queue_len: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: LINK_PORT,
            discovery_port: DISCOVERY_PORT,
            advertise: true,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            peer_timeout_ms: 5000,
            send_queue_len: 256,
            event_queue_len: 1000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl LinkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn peer_timeout(&self) -> Option<Duration> {
        (self.peer_timeout_ms > 0).then(|| Duration::from_millis(self.peer_timeout_ms))
    }
}

/// Redial policy for a joined session whose connection dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 250,
            max_delay_ms: 8000,
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before redial number `attempt` (starting at 0), or `None` once
    /// the attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}
