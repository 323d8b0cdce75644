//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 23186;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (all interfaces by default).
    pub bind_addr: IpAddr,

    /// TCP port.
    pub port: u16,

    /// Drop connections idle for this long (None = never).
    pub inactivity_timeout: Option<Duration>,

    /// Delay before answering a rejected authentication attempt.
    pub auth_rejection_time: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            inactivity_timeout: None,
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Create a server config listening on `port` on all interfaces.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Set the bind address.
    #[must_use]
    pub const fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the inactivity timeout; zero disables it.
    #[must_use]
    pub const fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
        self
    }

    /// Socket address the listener binds.
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 23186);
        assert!(config.bind_addr.is_unspecified());
        assert!(config.inactivity_timeout.is_none());
    }

    #[test]
    fn custom_port_and_address() {
        let config = ServerConfig::new(2222).with_bind_addr("127.0.0.1".parse().unwrap());
        assert_eq!(config.socket_addr(), "127.0.0.1:2222".parse().unwrap());
    }

    #[test]
    fn zero_inactivity_timeout_disables_it() {
        let config = ServerConfig::new(2222).with_inactivity_timeout(Duration::ZERO);
        assert!(config.inactivity_timeout.is_none());

        let config = config.with_inactivity_timeout(Duration::from_secs(30));
        assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(30)));
    }
}
