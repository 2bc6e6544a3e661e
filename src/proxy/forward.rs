//! Fixed-target port forwarding.
//!
//! Every connection accepted on the local listener gets its own tunnel to
//! the same target. Useful for applications without SOCKS5 support.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::client::TunnelClient;
use crate::error::Result;
use crate::protocol::TargetAddr;
use crate::proxy::NoOpMetrics;

/// Forward connections on `listener` to `target` until `shutdown` is cancelled.
pub async fn run_port_forward(
    listener: TcpListener,
    client: Arc<TunnelClient>,
    target: TargetAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(
        "Forwarding {} to {} via relay {}",
        local_addr,
        target,
        client.config().relay_addr()
    );

    let target = Arc::new(target);
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Port forward shutting down");
                break;
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);

                let client = Arc::clone(&client);
                let target = Arc::clone(&target);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let tunnel = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        opened = client.open(&target) => match opened {
                            Ok(tunnel) => tunnel,
                            Err(e) => {
                                tracing::warn!(%peer, target_addr = %target, error = %e, "tunnel open failed");
                                return;
                            }
                        },
                    };

                    let result = tunnel
                        .into_session(stream)
                        .run(&shutdown, client.config().relay_options(), &NoOpMetrics)
                        .await;
                    if let Err(e) = result {
                        tracing::debug!(%peer, error = %e, "forwarded session failed");
                    }
                });
            }
        }
    }

    Ok(())
}
