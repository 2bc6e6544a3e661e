//! Client-side SOCKS5 front end.
//!
//! Listens on a local port, accepts SOCKS5 CONNECT requests, and opens one
//! tunnel per request. Only the NO AUTHENTICATION method is offered.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::client::TunnelClient;
use crate::error::{Error, Result, SOCKS5_REPLY_GENERAL_FAILURE};
use crate::protocol::{with_timeout, TargetAddr};
use crate::proxy::{NoOpMetrics, RelayStats};

pub const SOCKS5_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Run the SOCKS5 proxy until `shutdown` is cancelled.
pub async fn run_socks5_proxy(
    listener: TcpListener,
    client: Arc<TunnelClient>,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(
        "SOCKS5 proxy listening on {}, relay {}",
        local_addr,
        client.config().relay_addr()
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("SOCKS5 proxy shutting down");
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
                tracing::debug!(%peer, "SOCKS5 connection");

                let client = Arc::clone(&client);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match handle_socks5_client(stream, &client, &shutdown).await {
                        Ok(stats) => tracing::debug!(
                            %peer,
                            sent = stats.bytes_sealed,
                            received = stats.bytes_opened,
                            "SOCKS5 session closed"
                        ),
                        Err(e) => tracing::debug!(%peer, error = %e, "SOCKS5 session failed"),
                    }
                });
            }
        }
    }

    Ok(())
}

/// Serve one local application: negotiate, open a tunnel, relay.
///
/// Failures to open the tunnel are reported to the application with the
/// matching SOCKS5 reply code before the connection is closed.
pub async fn handle_socks5_client<S>(
    mut local: S,
    client: &TunnelClient,
    shutdown: &CancellationToken,
) -> Result<RelayStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let negotiate_timeout = client.config().handshake_timeout;
    let target = with_timeout(negotiate_timeout, read_connect_request(&mut local)).await?;
    tracing::debug!(target_addr = %target, "SOCKS5 CONNECT");

    let tunnel = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            let _ = write_reply(&mut local, SOCKS5_REPLY_GENERAL_FAILURE).await;
            return Err(Error::socks5("shutting down"));
        }
        opened = client.open(&target) => match opened {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let _ = write_reply(&mut local, e.socks5_reply()).await;
                return Err(e);
            }
        },
    };

    write_reply(&mut local, REPLY_SUCCEEDED).await?;

    tunnel
        .into_session(local)
        .run(shutdown, client.config().relay_options(), &NoOpMetrics)
        .await
}

/// Run method negotiation and read a CONNECT request.
///
/// Unsupported commands and address types are answered with the matching
/// reply code; the caller closes the connection on any error.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::socks5(format!("unsupported version {:#04x}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(Error::socks5("client does not offer NO AUTHENTICATION"));
    }
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS5_VERSION {
        return Err(Error::socks5(format!("unsupported version {:#04x}", req[0])));
    }
    if req[1] != CMD_CONNECT {
        write_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::socks5(format!("unsupported command {:#04x}", req[1])));
    }

    let host = match req[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            match String::from_utf8(domain) {
                Ok(domain) => domain,
                Err(_) => {
                    write_reply(stream, SOCKS5_REPLY_GENERAL_FAILURE).await?;
                    return Err(Error::socks5("domain name is not UTF-8"));
                }
            }
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        other => {
            write_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(Error::socks5(format!("unsupported address type {:#04x}", other)));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    match TargetAddr::new(host, port) {
        Ok(target) => Ok(target),
        Err(e) => {
            write_reply(stream, SOCKS5_REPLY_GENERAL_FAILURE).await?;
            Err(Error::socks5(e.to_string()))
        }
    }
}

/// Send a reply with an all-zero IPv4 bound address.
pub async fn write_reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}
