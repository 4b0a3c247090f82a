//! Protocol and Service Configuration
//!
//! Tunables for the command protocol and the control service, with the fixed
//! defaults the running system uses. Tests construct shrunken variants.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Cadence at which each side of a connection sends a liveness `NoOp`.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Window over which rapid configuration/state changes are coalesced into a
/// single broadcast.
pub const CONTROL_SERVICE_BATCHING_DELAY: Duration = Duration::from_millis(100);

/// Age at which a node's state contribution is considered stale and wiped.
/// Twenty ping intervals: a healthy agent refreshes its contribution many
/// times per window.
pub const EXPIRATION_TIME: Duration = Duration::from_secs(600);

/// Largest value a single frame entry may carry on the wire. Larger logical
/// values are chunked across synthesized keys.
pub const MAX_VALUE_LENGTH: usize = 65_535;

/// Per-connection protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Liveness ping cadence
    pub ping_interval: Duration,
}

impl ProtocolConfig {
    /// The idle-abort deadline: one missed ping of slack.
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval * 2
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ping_interval: PING_INTERVAL,
        }
    }
}

/// Control service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlServiceConfig {
    /// Per-connection protocol configuration
    pub protocol: ProtocolConfig,

    /// Broadcast coalescing window
    pub batching_delay: Duration,

    /// Node-contribution staleness threshold
    pub expiration_time: Duration,
}

impl Default for ControlServiceConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            batching_delay: CONTROL_SERVICE_BATCHING_DELAY,
            expiration_time: EXPIRATION_TIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_is_twice_ping_interval() {
        let config = ProtocolConfig::default();
        assert_eq!(config.idle_timeout(), PING_INTERVAL * 2);
    }

    #[test]
    fn expiration_time_exceeds_ping_interval_by_safe_margin() {
        assert!(EXPIRATION_TIME >= PING_INTERVAL * 2);
    }
}
