//! Live-view server configuration

use std::net::SocketAddr;

use serde::Deserialize;

/// Default listen address for viewer connections
pub const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 8082);

/// Server configuration options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent viewer connections (0 = unlimited)
    pub max_connections: usize,

    /// Encoded chunks queued per viewer before it is dropped as too slow
    pub subscriber_buffer: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(DEFAULT_BIND_ADDR),
            max_connections: 0, // Unlimited
            subscriber_buffer: 256,
            tcp_nodelay: true, // Video chunks should not wait on Nagle
        }
    }
}

impl ServerConfig {
    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-viewer chunk queue length (at least 1)
    pub fn subscriber_buffer(mut self, chunks: usize) -> Self {
        self.subscriber_buffer = chunks.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 8082);
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.subscriber_buffer, 256);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_subscriber_buffer_floor() {
        let config = ServerConfig::default().subscriber_buffer(0);

        assert_eq!(config.subscriber_buffer, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .max_connections(10)
            .subscriber_buffer(8);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.subscriber_buffer, 8);
    }
}
