//! Configuration type definitions.

use super::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Address to listen on (server) or connect to (client).
    pub address: String,

    /// Port to listen on or connect to.
    pub port: u16,

    /// Maximum number of live connections.
    pub max_clients: usize,

    /// Read chunk size in bytes.
    pub buffer_size: usize,

    /// Hosts accepted in the `Origin` header. Empty accepts any origin.
    pub allowed_origins: Vec<String>,

    /// `User-Agent` sent by the client handshake.
    pub user_agent: String,

    /// Install a console log subscriber in the binary.
    pub enable_logging: bool,

    /// Readiness wait timeout.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// How long a client waits for the handshake response, and how long the
    /// server waits for a complete opening request.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Largest accepted handshake request or response head.
    pub max_handshake_size: usize,

    /// Largest accepted frame payload.
    pub max_frame_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            max_clients: 1000,
            buffer_size: 2048,
            allowed_origins: Vec::new(),
            user_agent: "client".to_string(),
            enable_logging: false,
            poll_timeout: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(5),
            max_handshake_size: 8192,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Config for `address:port` with every other option at its default.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the connection limit.
    #[must_use]
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Set the origin allow-list.
    #[must_use]
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve `address:port` to a socket address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the address does not resolve.
    pub fn socket_addr(&self) -> ConfigResult<SocketAddr> {
        let invalid = |message: String| ConfigError::InvalidValue {
            field: "address".to_string(),
            message,
        };
        (self.address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| invalid(format!("'{}': {e}", self.address)))?
            .next()
            .ok_or_else(|| invalid(format!("'{}' did not resolve", self.address)))
    }
}
