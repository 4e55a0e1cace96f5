//! Centralized configuration for the RPC engine.
//!
//! Protocol constants live on unit structs in the same style as the rest of the
//! workspace; per-connection tunables are carried by [`PeerConfig`] and
//! [`ServerConfig`], which can be overridden from the environment.

use std::time::Duration;

/// Fixed protocol parameters shared by every peer.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const REQUEST_TYPE: u64 = 0;
    pub const RESPONSE_TYPE: u64 = 1;
    pub const NOTIFICATION_TYPE: u64 = 3;
    /// Call ids restart from zero once this value has been issued.
    pub const ID_WRAP_BOUND: u32 = 1 << 30;
    pub const PRIVATE_METHOD_PREFIX: char = '_';
}

/// Network-related defaults.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long the server waits for a closed client's reader to finish.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONCURRENT_CALLS: usize = 256;
    pub const MAX_PENDING_CALLS: usize = 65_536;
    pub const MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const CLOSE_NORMAL: u16 = 1000;
    pub const CLOSE_GOING_AWAY: u16 = 1001;
    pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Inbound handler invocations allowed to run at once.
    pub max_concurrent_calls: usize,
    /// Outbound calls allowed to await a response at once.
    pub max_pending_calls: usize,
    /// Largest partial frame the decoder will buffer.
    pub max_buffered_bytes: usize,
    /// Interval between keep-alive pings, if any.
    pub heartbeat_interval: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: NetworkConfig::MAX_CONCURRENT_CALLS,
            max_pending_calls: NetworkConfig::MAX_PENDING_CALLS,
            max_buffered_bytes: NetworkConfig::MAX_BUFFERED_BYTES,
            heartbeat_interval: None,
            connect_timeout: NetworkConfig::CONNECT_TIMEOUT,
        }
    }
}

impl PeerConfig {
    /// Defaults overridden by `MPRPC_MAX_CONCURRENT_CALLS`,
    /// `MPRPC_MAX_PENDING_CALLS` and `MPRPC_HEARTBEAT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_usize("MPRPC_MAX_CONCURRENT_CALLS") {
            config.max_concurrent_calls = v;
        }
        if let Some(v) = env_usize("MPRPC_MAX_PENDING_CALLS") {
            config.max_pending_calls = v;
        }
        if let Some(v) = env_usize("MPRPC_HEARTBEAT_SECS") {
            config.heartbeat_interval = Some(Duration::from_secs(v as u64));
        }
        config
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit.max(1);
        self
    }
}

/// Settings for an accepting server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_connections: usize,
    /// How long a closed connection's reader may keep running before it is
    /// aborted.
    pub close_timeout: Duration,
    /// Applied to every accepted peer.
    pub peer: PeerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: NetworkConfig::MAX_CONNECTIONS,
            close_timeout: NetworkConfig::CLOSE_TIMEOUT,
            peer: PeerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            peer: PeerConfig::from_env(),
            ..Self::default()
        };
        if let Some(v) = env_usize("MPRPC_MAX_CONNECTIONS") {
            config.max_connections = v;
        }
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_tags_are_distinct() {
        assert_eq!(ProtocolConfig::REQUEST_TYPE, 0);
        assert_eq!(ProtocolConfig::RESPONSE_TYPE, 1);
        assert_eq!(ProtocolConfig::NOTIFICATION_TYPE, 3);
    }

    #[test]
    fn test_defaults_are_reasonable() {
        let config = PeerConfig::default();
        assert!(config.max_concurrent_calls > 0);
        assert!(config.max_pending_calls > config.max_concurrent_calls);
        assert!(config.heartbeat_interval.is_none());
        assert!(NetworkConfig::CONNECT_TIMEOUT > Duration::ZERO);
        assert_eq!(ServerConfig::default().close_timeout, NetworkConfig::CLOSE_TIMEOUT);
    }

    #[test]
    fn test_concurrency_limit_floor() {
        let config = PeerConfig::default().with_max_concurrent_calls(0);
        assert_eq!(config.max_concurrent_calls, 1);
    }
}
