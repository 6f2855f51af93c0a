//! Relay configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Port the relay listens on by default.
pub const DEFAULT_PORT: u16 = 12345;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,

    /// Time allowed for the WebSocket upgrade of a fresh TCP connection.
    pub handshake_timeout: Duration,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Messages a single mailbox holds before pushes get `BufferFull`.
    pub mailbox_capacity: usize,

    /// Declared payload lengths at or above this are refused with
    /// `UnknownError`.
    pub max_payload_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            handshake_timeout: Duration::from_secs(10),
            max_connections: 100,
            mailbox_capacity: 100,
            max_payload_len: 255,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration listening on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builder: set the upgrade timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Builder: set mailbox capacity.
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Builder: set the exclusive payload length limit.
    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }

    /// Limits the request handler enforces.
    pub fn limits(&self) -> RelayLimits {
        RelayLimits {
            mailbox_capacity: self.mailbox_capacity,
            max_payload_len: self.max_payload_len,
        }
    }
}

/// The subset of [`ServerConfig`] that shapes replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    pub mailbox_capacity: usize,
    pub max_payload_len: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        ServerConfig::default().limits()
    }
}

/// `0.0.0.0:12345`.
pub fn default_bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 12345);
        assert!(config.bind_addr.ip().is_unspecified());
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.mailbox_capacity, 100);
        assert_eq!(config.max_payload_len, 255);
    }

    #[test]
    fn custom_config() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ServerConfig::new(addr)
            .with_handshake_timeout(Duration::from_secs(2))
            .with_max_connections(0)
            .with_mailbox_capacity(5)
            .with_max_payload_len(64);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.max_connections, 1);
        assert_eq!(
            config.limits(),
            RelayLimits {
                mailbox_capacity: 5,
                max_payload_len: 64
            }
        );
    }
}
