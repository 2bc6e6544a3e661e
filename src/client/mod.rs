//! Client role of the tunnel.
//!
//! [`TunnelClient`] opens one transport connection and runs one handshake
//! per tunneled destination. The resulting [`Tunnel`] is bound to a local
//! stream to form a relay [`Session`].

mod catalog;
mod config;

pub use catalog::{Location, LocationCatalog};
pub use config::{ClientConfig, DEFAULT_RELAY_PORT};

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::crypto::CipherContext;
use crate::error::{Error, Result};
use crate::protocol::{handshake, TargetAddr};
use crate::proxy::Session;

/// Opens tunnels through a single relay node.
pub struct TunnelClient {
    config: ClientConfig,
    // Starting context for every handshake, derived once
    base_cipher: CipherContext,
}

impl TunnelClient {
    /// Create a client. Derives the password key up front when one is set.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let base_cipher = CipherContext::new(config.password.as_deref(), &config.kdf)
            .with_ttl(config.token_ttl);
        Ok(Self {
            config,
            base_cipher,
        })
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to the relay and declare `target`.
    ///
    /// The key received from the relay replaces the client's own before the
    /// declaration is encrypted, so the client password is never checked
    /// against the relay's.
    pub async fn open(&self, target: &TargetAddr) -> Result<Tunnel> {
        let relay = self.config.relay_addr();
        let connect = TcpStream::connect((self.config.relay_host.as_str(), self.config.relay_port));
        let mut stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::unreachable(&relay, e)),
            Err(_) => {
                return Err(Error::unreachable(
                    &relay,
                    format!(
                        "connect timed out after {}ms",
                        self.config.connect_timeout.as_millis()
                    ),
                ))
            }
        };
        stream.set_nodelay(true)?;

        let mut cipher = self.base_cipher.clone();
        handshake::initiate(
            &mut stream,
            &mut cipher,
            target,
            self.config.handshake_timeout,
        )
        .await?;

        tracing::debug!(
            relay = %relay,
            target_addr = %target,
            key = %cipher.key_fingerprint(),
            "tunnel established"
        );

        Ok(Tunnel {
            stream,
            cipher: Arc::new(cipher),
            target: target.clone(),
        })
    }
}

/// An established tunnel: relay connection past the handshake.
pub struct Tunnel {
    stream: TcpStream,
    cipher: Arc<CipherContext>,
    target: TargetAddr,
}

impl Tunnel {
    /// The declared target.
    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// The cipher context holding the relay's key.
    pub fn cipher(&self) -> &Arc<CipherContext> {
        &self.cipher
    }

    /// Bind `local` as the plaintext side of a relay session.
    pub fn into_session<L>(self, local: L) -> Session<L, TcpStream>
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        Session::new(local, self.stream, self.cipher, self.target)
    }
}
