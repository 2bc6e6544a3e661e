//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::token::sealed_len;
use crate::crypto::{CipherContext, KdfParams, DEFAULT_ITERATIONS, DEFAULT_SALT};
use crate::error::{Error, Result};
use crate::protocol::{CHUNK_SIZE, MAX_HANDSHAKE_FRAME};
use crate::proxy::RelayOptions;

/// Smallest possible target declaration, `a:1`.
const MIN_DECLARATION_LEN: usize = 3;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Shared password; a random key is generated when absent
    pub password: Option<String>,
    /// Key derivation parameters for `password`
    pub kdf: KdfParams,
    /// Bound on the outbound connect to a declared target
    pub connect_timeout: Duration,
    /// Bound on the whole handshake
    pub handshake_timeout: Duration,
    /// Bound on a single blocked write while relaying
    pub io_timeout: Duration,
    /// Largest accepted target declaration token
    pub max_handshake_frame: usize,
    /// Reject tokens older than this, if set
    pub token_ttl: Option<Duration>,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// How long shutdown waits for sessions to drain
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Create a configuration with default limits and no password.
    pub fn new(listen_addr: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            password: None,
            kdf: KdfParams::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_millis(crate::HANDSHAKE_TIMEOUT_MS),
            io_timeout: Duration::from_secs(30),
            max_handshake_frame: MAX_HANDSHAKE_FRAME,
            token_ttl: None,
            max_sessions: 10000,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Address to bind, as `addr:port`.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.contains(':') {
            format!("[{}]:{}", self.listen_addr, self.listen_port)
        } else {
            format!("{}:{}", self.listen_addr, self.listen_port)
        }
    }

    /// Build the long-lived cipher context every session shares.
    pub fn cipher(&self) -> CipherContext {
        CipherContext::new(self.password.as_deref(), &self.kdf).with_ttl(self.token_ttl)
    }

    /// Relay loop options for server sessions.
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            io_timeout: self.io_timeout,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if self.listen_port == 0 {
            return Err(Error::config("listen_port cannot be 0"));
        }
        if self.max_handshake_frame < sealed_len(MIN_DECLARATION_LEN) {
            return Err(Error::config(format!(
                "max_handshake_frame must be at least {}",
                sealed_len(MIN_DECLARATION_LEN)
            )));
        }
        if self.max_sessions == 0 {
            return Err(Error::config("max_sessions must be positive"));
        }
        if self.connect_timeout.is_zero()
            || self.handshake_timeout.is_zero()
            || self.io_timeout.is_zero()
        {
            return Err(Error::config("timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Shared password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// KDF salt (hex)
    pub kdf_salt_hex: String,
    /// KDF iteration count
    pub kdf_iterations: u32,
    /// Target connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Handshake timeout (seconds)
    pub handshake_timeout_secs: u64,
    /// Write timeout while relaying (seconds)
    pub io_timeout_secs: u64,
    /// Largest accepted target declaration token (bytes)
    pub max_handshake_frame: usize,
    /// Token freshness window (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_ttl_secs: Option<u64>,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Shutdown drain time (seconds)
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            listen_port: 8888,
            password: None,
            kdf_salt_hex: hex::encode(DEFAULT_SALT),
            kdf_iterations: DEFAULT_ITERATIONS,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            io_timeout_secs: 30,
            max_handshake_frame: MAX_HANDSHAKE_FRAME,
            token_ttl_secs: None,
            max_sessions: 10000,
            shutdown_grace_secs: 5,
        }
    }
}

impl ServerConfigFile {
    /// Parse TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid server config: {}", e)))
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Serialize as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let kdf = KdfParams::from_hex_salt(&self.kdf_salt_hex, self.kdf_iterations)?;

        Ok(ServerConfig {
            listen_addr: self.listen_addr.clone(),
            listen_port: self.listen_port,
            password: self.password.clone().filter(|p| !p.is_empty()),
            kdf,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            max_handshake_frame: self.max_handshake_frame,
            token_ttl: self.token_ttl_secs.map(Duration::from_secs),
            max_sessions: self.max_sessions,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            password: config.password.clone(),
            kdf_salt_hex: config.kdf.salt_hex(),
            kdf_iterations: config.kdf.iterations(),
            connect_timeout_secs: config.connect_timeout.as_secs(),
            handshake_timeout_secs: config.handshake_timeout.as_secs(),
            io_timeout_secs: config.io_timeout.as_secs(),
            max_handshake_frame: config.max_handshake_frame,
            token_ttl_secs: config.token_ttl.map(|ttl| ttl.as_secs()),
            max_sessions: config.max_sessions,
            shutdown_grace_secs: config.shutdown_grace.as_secs(),
        }
    }
}
