//! Wire framing.
//!
//! Two framings cross a tunnel connection:
//!
//! - the **key frame**, sent once by the relay: `[u32 BE length][key bytes]`
//! - **tokens**, in both directions afterwards: each token is followed by a
//!   single `\n`, which never occurs inside the base64 token alphabet

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::crypto::token::sealed_len;
use crate::error::{Error, Result};

/// Key frame length prefix size.
pub const KEY_FRAME_HEADER_SIZE: usize = 4;

/// Upper bound accepted for the key frame body.
pub const MAX_KEY_FRAME_LEN: usize = 1024;

/// Terminator written after every token.
pub const TOKEN_DELIMITER: u8 = b'\n';

/// Encode a key frame.
pub fn encode_key_frame(key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(KEY_FRAME_HEADER_SIZE + key.len()));
    buf.put_u32(key.len() as u32);
    buf.put_slice(key);
    buf
}

/// Write a key frame in a single write.
pub async fn write_key_frame<W>(writer: &mut W, key: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_key_frame(key);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one key frame.
///
/// A short read or an out-of-range length is a handshake failure.
pub async fn read_key_frame<R>(reader: &mut R) -> Result<Zeroizing<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; KEY_FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| eof_as_handshake(e, "truncated key frame header"))?;

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_KEY_FRAME_LEN {
        return Err(Error::handshake(format!(
            "key frame length {} out of range 1..={}",
            len, MAX_KEY_FRAME_LEN
        )));
    }

    let mut key = Zeroizing::new(vec![0u8; len]);
    reader
        .read_exact(&mut key)
        .await
        .map_err(|e| eof_as_handshake(e, "truncated key frame"))?;
    Ok(key)
}

fn eof_as_handshake(err: std::io::Error, what: &str) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::handshake(what)
    } else {
        Error::Transport(err)
    }
}

/// Splits a byte stream into delimited tokens.
///
/// Bytes accumulate in a caller-owned `BytesMut`; each call to
/// [`TokenCodec::decode`] yields at most one complete token. A run of bytes
/// longer than the maximum token length without a terminator is rejected
/// rather than buffered without bound.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    max_token_len: usize,
    // Bytes already scanned for a terminator in the current buffer
    scanned: usize,
}

impl TokenCodec {
    /// Codec accepting tokens up to `max_token_len` bytes (terminator excluded).
    pub fn new(max_token_len: usize) -> Self {
        Self {
            max_token_len,
            scanned: 0,
        }
    }

    /// Codec sized for tokens carrying up to `chunk_size` plaintext bytes.
    pub fn for_chunk_size(chunk_size: usize) -> Self {
        Self::new(sealed_len(chunk_size))
    }

    /// Largest token this codec accepts.
    pub fn max_token_len(&self) -> usize {
        self.max_token_len
    }

    /// Take the next complete token out of `buf`, if one is buffered.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>> {
        let start = self.scanned.min(buf.len());
        match buf[start..].iter().position(|&b| b == TOKEN_DELIMITER) {
            Some(offset) => {
                let end = start + offset;
                self.scanned = 0;
                if end > self.max_token_len {
                    return Err(Error::integrity(format!(
                        "token of {} bytes exceeds limit of {}",
                        end, self.max_token_len
                    )));
                }
                let token = buf.split_to(end);
                buf.advance(1);
                if token.is_empty() {
                    return Err(Error::integrity("empty token"));
                }
                Ok(Some(token))
            }
            None => {
                if buf.len() > self.max_token_len {
                    return Err(Error::integrity(format!(
                        "unterminated token exceeds limit of {} bytes",
                        self.max_token_len
                    )));
                }
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }

    /// Append `token` and its terminator to `dst`.
    pub fn encode(&self, token: &[u8], dst: &mut BytesMut) {
        dst.reserve(token.len() + 1);
        dst.put_slice(token);
        dst.put_u8(TOKEN_DELIMITER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_frame_layout() {
        let frame = encode_key_frame(b"abcd");
        assert_eq!(&frame[..], &[0, 0, 0, 4, b'a', b'b', b'c', b'd']);
    }

    #[tokio::test]
    async fn test_read_key_frame() {
        let frame = encode_key_frame(&[0x41; 44]);
        let mut reader: &[u8] = &frame;
        let key = read_key_frame(&mut reader).await.unwrap();
        assert_eq!(key.len(), 44);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_read_key_frame_truncated() {
        let frame = encode_key_frame(&[0x41; 44]);

        let mut header_only: &[u8] = &frame[..2];
        assert!(matches!(
            read_key_frame(&mut header_only).await,
            Err(Error::Handshake(_))
        ));

        let mut short_body: &[u8] = &frame[..20];
        assert!(matches!(
            read_key_frame(&mut short_body).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_read_key_frame_bad_length() {
        let mut zero: &[u8] = &[0, 0, 0, 0];
        assert!(matches!(read_key_frame(&mut zero).await, Err(Error::Handshake(_))));

        let mut huge: &[u8] = &[0xff, 0xff, 0xff, 0xff, 1, 2, 3];
        assert!(matches!(read_key_frame(&mut huge).await, Err(Error::Handshake(_))));
    }

    #[test]
    fn test_codec_splits_tokens() {
        let mut codec = TokenCodec::new(64);
        let mut buf = BytesMut::new();
        codec.encode(b"first", &mut buf);
        codec.encode(b"second", &mut buf);
        buf.extend_from_slice(b"thi");

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"rd\n");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"third");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_byte_at_a_time() {
        let mut codec = TokenCodec::new(64);
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for &b in b"abc\ndef\n" {
            buf.put_u8(b);
            while let Some(token) = codec.decode(&mut buf).unwrap() {
                out.push(token.to_vec());
            }
        }
        assert_eq!(out, vec![b"abc".to_vec(), b"def".to_vec()]);
    }

    #[test]
    fn test_codec_rejects_oversized() {
        let mut codec = TokenCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Integrity(_))));

        let mut codec = TokenCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_codec_rejects_empty_token() {
        let mut codec = TokenCodec::new(8);
        let mut buf = BytesMut::from(&b"\nabc\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_for_chunk_size() {
        let codec = TokenCodec::for_chunk_size(4096);
        assert_eq!(codec.max_token_len(), sealed_len(4096));
    }
}
