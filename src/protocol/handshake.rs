//! The two-message tunnel bootstrap.
//!
//! ```text
//! Client                                   Relay
//!   |                                        |  AwaitingHandshake
//!   |   [u32 len][key]  (in the clear)       |
//!   |<---------------------------------------|  KeySent
//!   |  replace_key                           |
//!   |   token("host:port") \n                |
//!   |--------------------------------------->|  TargetReceived
//!   |                                        |  connect(host:port)
//!   |========== relaying (tokens) ===========|  Relaying
//! ```

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

use crate::crypto::CipherContext;
use crate::error::{Error, Result};
use crate::protocol::frame::{read_key_frame, write_key_frame, TokenCodec};
use crate::protocol::{with_timeout, write_all_timeout, TargetAddr};

const READ_CHUNK: usize = 1024;

/// Relay side, first message: send the active key.
pub async fn send_key<S>(stream: &mut S, cipher: &CipherContext) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let key = cipher.encoded_key();
    write_key_frame(stream, key.as_bytes()).await
}

/// Relay side, second message: read and decrypt the target declaration.
///
/// At most `max_frame` bytes are accepted for the declaration. Any bytes the
/// client pipelined after it are returned so the relay can forward them.
pub async fn read_target<S>(
    stream: &mut S,
    cipher: &CipherContext,
    max_frame: usize,
) -> Result<(TargetAddr, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut codec = TokenCodec::new(max_frame);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let token = loop {
        match codec.decode(&mut buf) {
            Ok(Some(token)) => break token,
            Ok(None) => {}
            Err(Error::Integrity(msg)) => return Err(Error::handshake(msg)),
            Err(e) => return Err(e),
        }

        buf.reserve(READ_CHUNK);
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::handshake(
                "connection closed before target declaration",
            ));
        }
    };

    let plaintext = cipher
        .decrypt(&token)
        .map_err(|e| Error::handshake(format!("undecryptable target declaration: {}", e)))?;
    if plaintext.is_empty() {
        return Err(Error::handshake("empty target declaration"));
    }
    let declaration = std::str::from_utf8(&plaintext)
        .map_err(|_| Error::handshake("target declaration is not UTF-8"))?;
    let target = TargetAddr::parse(declaration)?;

    Ok((target, buf))
}

/// Relay side: open the outbound connection to the declared target.
pub async fn connect_target(target: &TargetAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let connect = TcpStream::connect((target.host(), target.port()));
    match tokio::time::timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::unreachable(target, e)),
        Err(_) => Err(Error::unreachable(
            target,
            format!("connect timed out after {}ms", connect_timeout.as_millis()),
        )),
    }
}

/// Relay side, both messages under a single deadline.
pub async fn accept<S>(
    stream: &mut S,
    cipher: &CipherContext,
    max_frame: usize,
    handshake_timeout: Duration,
) -> Result<(TargetAddr, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(handshake_timeout, async {
        send_key(stream, cipher).await?;
        read_target(stream, cipher, max_frame).await
    })
    .await
}

/// Client side: receive the relay's key, adopt it, and declare `target`.
///
/// The declaration is one token written in a single write.
pub async fn initiate<S>(
    stream: &mut S,
    cipher: &mut CipherContext,
    target: &TargetAddr,
    handshake_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = with_timeout(handshake_timeout, read_key_frame(stream)).await?;
    cipher.replace_key(&key)?;
    tracing::trace!(target_addr = %target, "key received");

    let token = cipher.encrypt(target.to_string().as_bytes());
    let mut out = BytesMut::new();
    TokenCodec::new(token.len()).encode(&token, &mut out);

    write_all_timeout(stream, &out, handshake_timeout).await?;
    tracing::trace!(target_addr = %target, "target sent");

    Ok(())
}
