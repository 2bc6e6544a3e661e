//! The per-session relay loop.
//!
//! A [`Session`] joins a plaintext stream (the local application, or the
//! target on the relay node) to an encrypted stream (the tunnel). Each read
//! of up to one chunk from the plaintext side becomes one token on the
//! encrypted side; each token from the encrypted side is verified and
//! written out as plaintext.
//!
//! Each stream is split into halves and each direction runs as its own
//! future with one writer per half. The two futures and the shutdown token
//! are raced in a single `select!`.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::crypto::CipherContext;
use crate::error::Result;
use crate::protocol::{write_all_timeout, TargetAddr, TokenCodec, CHUNK_SIZE};

/// Time allowed for shutting down each stream when a session ends.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Trait for recording relay byte counts.
///
/// Counts are plaintext bytes, reported after the write that carried them
/// completed.
pub trait RelayMetrics {
    /// Plaintext read from the plaintext side, encrypted and sent into the tunnel.
    fn record_sealed(&self, bytes: u64);
    /// Plaintext recovered from the tunnel and delivered to the plaintext side.
    fn record_opened(&self, bytes: u64);
}

/// No-op metrics implementation for cases where metrics aren't needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl RelayMetrics for NoOpMetrics {
    #[inline]
    fn record_sealed(&self, _bytes: u64) {}
    #[inline]
    fn record_opened(&self, _bytes: u64) {}
}

/// Why a relay loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Plaintext side reached end-of-stream
    LocalClosed,
    /// Encrypted side reached end-of-stream
    RemoteClosed,
    /// The shutdown token was cancelled
    Shutdown,
}

/// Summary of a finished relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_sealed: u64,
    pub bytes_opened: u64,
    pub end: RelayEnd,
}

/// Relay loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Bound on a single blocked write to either stream
    pub io_timeout: Duration,
    /// Plaintext bytes per read, and so per token
    pub chunk_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// One tunnel instance: two streams and the cipher that joins them.
pub struct Session<L, R> {
    local: L,
    remote: R,
    cipher: Arc<CipherContext>,
    target: TargetAddr,
    pending: BytesMut,
}

impl<L, R> Session<L, R>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    /// Bind a plaintext stream and an encrypted stream.
    pub fn new(local: L, remote: R, cipher: Arc<CipherContext>, target: TargetAddr) -> Self {
        Self {
            local,
            remote,
            cipher,
            target,
            pending: BytesMut::new(),
        }
    }

    /// Encrypted-side bytes already read off `remote` during the handshake.
    pub fn with_pending(mut self, pending: BytesMut) -> Self {
        self.pending = pending;
        self
    }

    /// The declared target of this session.
    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Relay until either side closes, an error occurs, or `shutdown` fires.
    ///
    /// The two directions run independently, so a stalled write in one never
    /// stops reads in the other. Whichever direction finishes first ends the
    /// session: both streams are shut down and dropped on every exit path. A
    /// token that fails verification ends the session before anything after
    /// it is forwarded.
    pub async fn run<M>(
        self,
        shutdown: &CancellationToken,
        options: RelayOptions,
        metrics: &M,
    ) -> Result<RelayStats>
    where
        M: RelayMetrics + ?Sized,
    {
        let Session {
            local,
            remote,
            cipher,
            target,
            pending,
        } = self;

        let (mut local_rd, mut local_wr) = tokio::io::split(local);
        let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
        let mut bytes_sealed = 0u64;
        let mut bytes_opened = 0u64;

        // The losing futures are dropped, cancelling any write they were blocked in
        let result = tokio::select! {
            biased;

            _ = shutdown.cancelled() => Ok(RelayEnd::Shutdown),

            end = seal_direction(
                &mut local_rd,
                &mut remote_wr,
                &cipher,
                &options,
                metrics,
                &mut bytes_sealed,
            ) => end,

            end = open_direction(
                &mut remote_rd,
                &mut local_wr,
                &cipher,
                pending,
                &options,
                metrics,
                &mut bytes_opened,
            ) => end,
        };

        close(&mut remote_wr).await;
        close(&mut local_wr).await;

        match result {
            Ok(end) => {
                tracing::debug!(
                    target_addr = %target,
                    ?end,
                    bytes_sealed,
                    bytes_opened,
                    "relay finished"
                );
                Ok(RelayStats {
                    bytes_sealed,
                    bytes_opened,
                    end,
                })
            }
            Err(e) => {
                tracing::debug!(
                    target_addr = %target,
                    error = %e,
                    bytes_sealed,
                    bytes_opened,
                    "relay aborted"
                );
                Err(e)
            }
        }
    }
}

/// Plaintext side to tunnel: one token per read.
async fn seal_direction<R, W, M>(
    local: &mut R,
    remote: &mut W,
    cipher: &CipherContext,
    options: &RelayOptions,
    metrics: &M,
    sealed: &mut u64,
) -> Result<RelayEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    M: RelayMetrics + ?Sized,
{
    let codec = TokenCodec::for_chunk_size(options.chunk_size);
    let mut chunk = vec![0u8; options.chunk_size];
    let mut outbound = BytesMut::with_capacity(codec.max_token_len() + 1);

    loop {
        let n = local.read(&mut chunk).await?;
        if n == 0 {
            return Ok(RelayEnd::LocalClosed);
        }
        let token = cipher.encrypt(&chunk[..n]);
        outbound.clear();
        codec.encode(&token, &mut outbound);
        write_all_timeout(remote, &outbound, options.io_timeout).await?;
        *sealed += n as u64;
        metrics.record_sealed(n as u64);
    }
}

/// Tunnel to plaintext side, starting with tokens pipelined behind the
/// target declaration.
async fn open_direction<R, W, M>(
    remote: &mut R,
    local: &mut W,
    cipher: &CipherContext,
    mut inbound: BytesMut,
    options: &RelayOptions,
    metrics: &M,
    opened: &mut u64,
) -> Result<RelayEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    M: RelayMetrics + ?Sized,
{
    let mut codec = TokenCodec::for_chunk_size(options.chunk_size);

    loop {
        while let Some(token) = codec.decode(&mut inbound)? {
            let plaintext = cipher.decrypt(&token)?;
            if plaintext.is_empty() {
                continue;
            }
            write_all_timeout(local, &plaintext, options.io_timeout).await?;
            *opened += plaintext.len() as u64;
            metrics.record_opened(plaintext.len() as u64);
        }

        inbound.reserve(options.chunk_size);
        if remote.read_buf(&mut inbound).await? == 0 {
            return Ok(RelayEnd::RemoteClosed);
        }
    }
}

async fn close<S: AsyncWrite + Unpin>(stream: &mut S) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{duplex, DuplexStream};

    #[derive(Default)]
    struct Counting {
        sealed: AtomicU64,
        opened: AtomicU64,
    }

    impl RelayMetrics for Counting {
        fn record_sealed(&self, bytes: u64) {
            self.sealed.fetch_add(bytes, Ordering::Relaxed);
        }
        fn record_opened(&self, bytes: u64) {
            self.opened.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn target() -> TargetAddr {
        TargetAddr::parse("example.com:443").unwrap()
    }

    /// Returns (app end, tunnel end, session)
    fn session(
        cipher: Arc<CipherContext>,
    ) -> (
        DuplexStream,
        DuplexStream,
        Session<DuplexStream, DuplexStream>,
    ) {
        let (app, local) = duplex(64 * 1024);
        let (tunnel, remote) = duplex(64 * 1024);
        (app, tunnel, Session::new(local, remote, cipher, target()))
    }

    async fn read_token(
        tunnel: &mut DuplexStream,
        buf: &mut BytesMut,
        cipher: &CipherContext,
    ) -> Vec<u8> {
        let mut codec = TokenCodec::for_chunk_size(CHUNK_SIZE);
        loop {
            if let Some(token) = codec.decode(buf).unwrap() {
                return cipher.decrypt(&token).unwrap();
            }
            assert!(tunnel.read_buf(buf).await.unwrap() > 0);
        }
    }

    fn wire(cipher: &CipherContext, plaintext: &[u8]) -> Vec<u8> {
        let mut out = cipher.encrypt(plaintext);
        out.push(b'\n');
        out
    }

    #[tokio::test]
    async fn test_both_directions() {
        let cipher = Arc::new(CipherContext::generate());
        let (mut app, mut tunnel, session) = session(cipher.clone());
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(Counting::default());

        let m = metrics.clone();
        let s = shutdown.clone();
        let relay =
            tokio::spawn(async move { session.run(&s, RelayOptions::default(), &*m).await });

        let mut buf = BytesMut::new();
        app.write_all(b"ping").await.unwrap();
        assert_eq!(read_token(&mut tunnel, &mut buf, &cipher).await, b"ping");

        tunnel.write_all(&wire(&cipher, b"pong")).await.unwrap();
        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(app);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.end, RelayEnd::LocalClosed);
        assert_eq!(stats.bytes_sealed, 4);
        assert_eq!(stats.bytes_opened, 4);
        assert_eq!(metrics.sealed.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.opened.load(Ordering::Relaxed), 4);

        // Tunnel side sees EOF after teardown
        let mut rest = Vec::new();
        tunnel.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pending_tokens_delivered_first() {
        let cipher = Arc::new(CipherContext::generate());
        let (mut app, tunnel, session) = session(cipher.clone());

        let mut pending = BytesMut::new();
        pending.extend_from_slice(&wire(&cipher, b"early "));
        pending.extend_from_slice(&wire(&cipher, b"bird"));
        let session = session.with_pending(pending);

        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(async move {
            session
                .run(&shutdown, RelayOptions::default(), &NoOpMetrics)
                .await
        });

        let mut buf = [0u8; 10];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early bird");

        drop(tunnel);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.end, RelayEnd::RemoteClosed);
    }

    #[tokio::test]
    async fn test_token_split_across_reads() {
        let cipher = Arc::new(CipherContext::generate());
        let (mut app, mut tunnel, session) = session(cipher.clone());
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(async move {
            session
                .run(&shutdown, RelayOptions::default(), &NoOpMetrics)
                .await
        });

        let frame = wire(&cipher, b"fragmented");
        let (a, b) = frame.split_at(frame.len() / 2);
        tunnel.write_all(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tunnel.write_all(b).await.unwrap();

        let mut buf = [0u8; 10];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fragmented");

        drop(tunnel);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fail_closed_on_corrupted_token() {
        let cipher = Arc::new(CipherContext::generate());
        let (mut app, mut tunnel, session) = session(cipher.clone());
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(async move {
            session
                .run(&shutdown, RelayOptions::default(), &NoOpMetrics)
                .await
        });

        let mut corrupted = cipher.encrypt(b"evil");
        let mid = corrupted.len() / 2;
        corrupted[mid] = if corrupted[mid] == b'A' { b'B' } else { b'A' };
        corrupted.push(b'\n');

        let mut stream = wire(&cipher, b"good");
        stream.extend_from_slice(&corrupted);
        stream.extend_from_slice(&wire(&cipher, b"after"));
        tunnel.write_all(&stream).await.unwrap();

        let err = relay.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "{:?}", err);

        // Only the bytes before the corrupted token arrive, then EOF
        let mut received = Vec::new();
        app.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"good");
    }

    #[tokio::test]
    async fn test_fail_closed_on_wrong_key() {
        let cipher = Arc::new(CipherContext::generate());
        let stranger = CipherContext::generate();
        let (mut app, mut tunnel, session) = session(cipher);
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(async move {
            session
                .run(&shutdown, RelayOptions::default(), &NoOpMetrics)
                .await
        });

        tunnel.write_all(&wire(&stranger, b"hello")).await.unwrap();
        assert!(relay.await.unwrap().unwrap_err().is_integrity_failure());

        let mut received = Vec::new();
        app.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_garbage_rejected() {
        let cipher = Arc::new(CipherContext::generate());
        let (_app, mut tunnel, session) = session(cipher);
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(async move {
            session
                .run(&shutdown, RelayOptions::default(), &NoOpMetrics)
                .await
        });

        tunnel.write_all(&vec![b'x'; 16 * 1024]).await.unwrap();
        assert!(relay.await.unwrap().unwrap_err().is_integrity_failure());
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_relay() {
        let cipher = Arc::new(CipherContext::generate());
        let (mut app, mut tunnel, session) = session(cipher);
        let shutdown = CancellationToken::new();
        let s = shutdown.clone();
        let relay = tokio::spawn(async move {
            session.run(&s, RelayOptions::default(), &NoOpMetrics).await
        });

        shutdown.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.end, RelayEnd::Shutdown);

        let mut buf = Vec::new();
        app.read_to_end(&mut buf).await.unwrap();
        tunnel.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_write() {
        let cipher = Arc::new(CipherContext::generate());
        let (mut app, local) = duplex(64 * 1024);
        // Tunnel peer stays open but never reads
        let (_tunnel, remote) = duplex(1024);
        let session = Session::new(local, remote, cipher, target());
        let shutdown = CancellationToken::new();
        let s = shutdown.clone();
        let relay = tokio::spawn(async move {
            session.run(&s, RelayOptions::default(), &NoOpMetrics).await
        });

        app.write_all(&vec![b'x'; 32 * 1024]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relay.is_finished());

        shutdown.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay stuck in write after shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(stats.end, RelayEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_full_duplex_echo_does_not_stall() {
        const TOTAL: usize = 2 * 1024 * 1024;

        let cipher = Arc::new(CipherContext::generate());
        let (app, local) = duplex(8 * 1024);
        let (tunnel, remote) = duplex(8 * 1024);
        let session = Session::new(local, remote, cipher, target());
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(async move {
            session
                .run(&shutdown, RelayOptions::default(), &NoOpMetrics)
                .await
        });

        // Tokens sealed by the session come straight back to it
        let echo = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(tunnel);
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });

        let (mut app_rd, mut app_wr) = tokio::io::split(app);
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            app_wr.write_all(&sent).await.unwrap();
            app_wr
        });

        let mut received = vec![0u8; TOTAL];
        tokio::time::timeout(Duration::from_secs(20), app_rd.read_exact(&mut received))
            .await
            .expect("full-duplex echo stalled")
            .unwrap();
        assert_eq!(received, payload);

        let app_wr = writer.await.unwrap();
        drop(app_wr);
        drop(app_rd);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.bytes_sealed, TOTAL as u64);
        assert_eq!(stats.bytes_opened, TOTAL as u64);
        echo.abort();
    }

    #[tokio::test]
    async fn test_large_transfer_is_chunked() {
        let cipher = Arc::new(CipherContext::generate());
        let (mut app, mut tunnel, session) = session(cipher.clone());
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(async move {
            session
                .run(&shutdown, RelayOptions::default(), &NoOpMetrics)
                .await
        });

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            app.write_all(&sent).await.unwrap();
            app
        });

        let mut buf = BytesMut::new();
        let mut received = Vec::new();
        while received.len() < payload.len() {
            let chunk = read_token(&mut tunnel, &mut buf, &cipher).await;
            assert!(chunk.len() <= CHUNK_SIZE);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);

        drop(writer.await.unwrap());
        relay.await.unwrap().unwrap();
    }
}
