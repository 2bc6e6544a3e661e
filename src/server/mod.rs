//! Relay node.
//!
//! ```text
//!   client ──TCP──▶ accept ──▶ worker task (one per connection)
//!                               │ send key            KeySent
//!                               │ read declaration    TargetReceived
//!                               │ connect target
//!                               ▼
//!                           relay loop  ◀──▶ target   Relaying
//! ```
//!
//! Workers share only the read-only [`CipherContext`], the session
//! registry and the metrics counters. A single cancellation token stops the
//! accept loop and every worker.

pub mod config;
mod metrics;
mod session;

pub use config::{ServerConfig, ServerConfigFile};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use session::{SessionGuard, SessionId, SessionRecord, SessionRegistry, SessionState, SessionStats};

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::crypto::CipherContext;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{handshake, with_timeout, TargetAddr};
use crate::proxy::{RelayStats, Session};

/// Main server instance.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    cipher: Arc<CipherContext>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Create a new server with the given configuration.
    ///
    /// The session key is derived (or generated) here, once.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        if config.password.is_some() && config.kdf.uses_default_salt() {
            tracing::warn!(
                "Password key uses the shared default salt; set kdf_salt_hex for this deployment"
            );
        }
        if config.password.is_none() {
            tracing::info!("No password configured, using a random key for this run");
        }

        let cipher = Arc::new(config.cipher());
        tracing::info!(key = %cipher.key_fingerprint(), "Session key ready");

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(config.max_sessions)),
            metrics: Arc::new(ServerMetrics::new()),
            shutdown: CancellationToken::new(),
            config: Arc::new(config),
            cipher,
        })
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Relay server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until [`RelayServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shut down, then wait up to
    /// the configured grace period for live sessions to finish.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Accept error: {}", e);
                            continue;
                        }
                    };
                    self.spawn_worker(stream, peer);
                }
            }
        }

        drop(listener);
        let live = self.registry.count();
        tracing::info!(sessions = live, "Relay server stopping");

        if !self.registry.wait_empty(self.config.shutdown_grace).await {
            tracing::warn!(
                sessions = self.registry.count(),
                "Sessions still open after shutdown grace period"
            );
        }
        tracing::info!("{}", self.metrics.format_report());

        Ok(())
    }

    fn spawn_worker(&self, stream: TcpStream, peer: SocketAddr) {
        let guard = match self.registry.register(peer, Arc::clone(&self.metrics)) {
            Some(guard) => guard,
            None => {
                self.metrics.increment_rejected();
                tracing::warn!(%peer, "Session limit reached, closing connection");
                return;
            }
        };

        let worker = Worker {
            config: Arc::clone(&self.config),
            cipher: Arc::clone(&self.cipher),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.clone(),
        };

        tokio::spawn(async move {
            let session = guard.record().id();
            worker.metrics.increment_connections();

            match worker.handle(stream, &guard).await {
                Ok(stats) => tracing::debug!(
                    session,
                    %peer,
                    upstream = stats.bytes_opened,
                    downstream = stats.bytes_sealed,
                    end = ?stats.end,
                    "Session closed"
                ),
                Err(e) => {
                    worker.metrics.record_error(&e);
                    match e.kind() {
                        ErrorKind::Integrity => {
                            tracing::warn!(session, %peer, error = %e, "Session closed on integrity failure")
                        }
                        _ => tracing::debug!(session, %peer, error = %e, "Session failed"),
                    }
                }
            }

            worker.metrics.decrement_connections();
            drop(guard);
        });
    }

    /// Stop accepting and signal every session to close.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Get session count.
    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Non-secret identifier of the session key.
    pub fn key_fingerprint(&self) -> String {
        self.cipher.key_fingerprint()
    }
}

/// Shared state a connection worker needs.
struct Worker {
    config: Arc<ServerConfig>,
    cipher: Arc<CipherContext>,
    metrics: Arc<ServerMetrics>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn handle(&self, mut inbound: TcpStream, guard: &SessionGuard) -> Result<RelayStats> {
        let record = guard.record();
        inbound.set_nodelay(true)?;

        let (target, pending, outbound) = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                return Err(Error::handshake("server shutting down"));
            }
            established = self.establish(&mut inbound, record) => established?,
        };

        record.set_state(SessionState::Relaying);
        self.metrics.increment_relayed();
        tracing::debug!(session = record.id(), target_addr = %target, "Relaying");

        Session::new(outbound, inbound, Arc::clone(&self.cipher), target)
            .with_pending(pending)
            .run(&self.shutdown, self.config.relay_options(), &**record)
            .await
    }

    /// Handshake and target connect. Dropping `inbound` on error closes it
    /// without relaying.
    async fn establish(
        &self,
        inbound: &mut TcpStream,
        record: &SessionRecord,
    ) -> Result<(TargetAddr, BytesMut, TcpStream)> {
        let (target, pending) = with_timeout(self.config.handshake_timeout, async {
            handshake::send_key(inbound, &self.cipher).await?;
            record.set_state(SessionState::KeySent);
            handshake::read_target(inbound, &self.cipher, self.config.max_handshake_frame).await
        })
        .await?;

        record.set_state(SessionState::TargetReceived);
        record.set_target(target.clone());

        let outbound = handshake::connect_target(&target, self.config.connect_timeout).await?;
        Ok((target, pending, outbound))
    }
}
