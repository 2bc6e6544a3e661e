//! Client configuration.

use std::time::Duration;

use crate::crypto::KdfParams;
use crate::error::{Error, Result};
use crate::proxy::RelayOptions;
use crate::protocol::CHUNK_SIZE;

/// Default relay node port.
pub const DEFAULT_RELAY_PORT: u16 = 8888;

/// Configuration for opening tunnels through one relay node.
#[derive(Clone)]
pub struct ClientConfig {
    /// Relay node host
    pub relay_host: String,
    /// Relay node port
    pub relay_port: u16,
    /// Shared password, if the deployment uses one
    pub password: Option<String>,
    /// Key derivation parameters for `password`
    pub kdf: KdfParams,
    /// Bound on the TCP connect to the relay
    pub connect_timeout: Duration,
    /// Bound on each handshake read/write
    pub handshake_timeout: Duration,
    /// Bound on a single blocked write while relaying
    pub io_timeout: Duration,
    /// Reject tokens older than this, if set
    pub token_ttl: Option<Duration>,
}

impl ClientConfig {
    /// Configuration for a relay at `host:port` with default timeouts.
    pub fn new(relay_host: impl Into<String>, relay_port: u16) -> Self {
        Self {
            relay_host: relay_host.into(),
            relay_port,
            password: None,
            kdf: KdfParams::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_millis(crate::HANDSHAKE_TIMEOUT_MS),
            io_timeout: Duration::from_secs(30),
            token_ttl: None,
        }
    }

    /// Parse a `host[:port]` relay address; the port defaults to 8888.
    ///
    /// IPv6 literals take a port only in brackets (`[::1]:9000`). A bare
    /// IPv6 literal is a host with the default port.
    pub fn from_relay_addr(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        let invalid_port = || Error::config(format!("invalid relay port in {:?}", addr));
        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::config(format!("unclosed '[' in {:?}", addr)))?;
            let port = match tail {
                "" => DEFAULT_RELAY_PORT,
                _ => tail
                    .strip_prefix(':')
                    .and_then(|port| port.parse().ok())
                    .ok_or_else(invalid_port)?,
            };
            (host, port)
        } else {
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => {
                    (host, port.parse().map_err(|_| invalid_port())?)
                }
                _ => (addr, DEFAULT_RELAY_PORT),
            }
        };
        let config = Self::new(host, port);
        config.validate()?;
        Ok(config)
    }

    /// Set the shared password.
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Relay address as `host:port`, with IPv6 hosts bracketed.
    pub fn relay_addr(&self) -> String {
        if self.relay_host.contains(':') {
            format!("[{}]:{}", self.relay_host, self.relay_port)
        } else {
            format!("{}:{}", self.relay_host, self.relay_port)
        }
    }

    /// Relay loop options derived from this configuration.
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            io_timeout: self.io_timeout,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.relay_host.is_empty() {
            return Err(Error::config("relay host cannot be empty"));
        }
        if self.relay_port == 0 {
            return Err(Error::config("relay port cannot be 0"));
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.io_timeout.is_zero() {
            return Err(Error::config("io timeout must be non-zero"));
        }
        Ok(())
    }
}
