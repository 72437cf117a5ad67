use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Connections silent for longer than this are dropped.
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("WATCH_PARTY_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            heartbeat_timeout: env::var("WATCH_PARTY_RELAY_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            heartbeat_check_interval: defaults.heartbeat_check_interval,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            heartbeat_timeout: Duration::from_secs(600),
            heartbeat_check_interval: Duration::from_secs(60),
        }
    }
}
