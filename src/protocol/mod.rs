//! Tunnel wire protocol.
//!
//! A connection starts with the [`handshake`]: the relay sends its key in a
//! length-prefixed frame, the client answers with an encrypted `host:port`
//! declaration. Everything after that is delimited tokens ([`frame`]).

pub mod frame;
pub mod handshake;
mod target;

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub use frame::{TokenCodec, MAX_KEY_FRAME_LEN, TOKEN_DELIMITER};
pub use target::TargetAddr;

use crate::error::{Error, Result};

/// Plaintext bytes read from a connection per relay step.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on the encrypted target declaration, delimiter excluded.
pub const MAX_HANDSHAKE_FRAME: usize = 4096;

/// Milliseconds for [`Error::Timeout`], saturating for durations past `u64`.
fn timeout_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Run `fut` with a deadline, reporting expiry as [`Error::Timeout`].
pub(crate) async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout_millis(duration))),
    }
}

/// Write and flush `data` with a deadline.
pub(crate) async fn write_all_timeout<W>(writer: &mut W, data: &[u8], duration: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    match tokio::time::timeout(duration, write).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout(timeout_millis(duration))),
    }
}
