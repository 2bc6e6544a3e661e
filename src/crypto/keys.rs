//! Tunnel key material.
//!
//! A tunnel key is 32 bytes: a 16-byte HMAC signing key followed by a
//! 16-byte AES-128 encryption key. On the wire (the handshake key frame)
//! it travels as the 44-character URL-safe base64 text of those bytes.

use base64::{engine::general_purpose::URL_SAFE, Engine};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{SecureRandom, HALF_KEY_SIZE, KEY_SIZE};
use crate::error::{Error, Result};

/// Length of the encoded key as sent in the handshake key frame.
pub const ENCODED_KEY_LEN: usize = 44;

/// Symmetric key for the tunnel token scheme.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TunnelKey {
    signing: [u8; HALF_KEY_SIZE],
    encryption: [u8; HALF_KEY_SIZE],
}

impl TunnelKey {
    /// Build a key from 32 raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let bytes = Zeroizing::new(bytes);
        let mut signing = [0u8; HALF_KEY_SIZE];
        let mut encryption = [0u8; HALF_KEY_SIZE];
        signing.copy_from_slice(&bytes[..HALF_KEY_SIZE]);
        encryption.copy_from_slice(&bytes[HALF_KEY_SIZE..]);
        Self {
            signing,
            encryption,
        }
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let bytes = SecureRandom::key_material();
        Self::from_bytes(*bytes)
    }

    /// Parse the encoded (URL-safe base64) form received from a peer.
    ///
    /// Surrounding ASCII whitespace is tolerated.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let text = encoded.trim_ascii();
        let raw = Zeroizing::new(
            URL_SAFE
                .decode(text)
                .map_err(|_| Error::handshake("key material is not valid base64"))?,
        );
        if raw.len() != KEY_SIZE {
            return Err(Error::handshake(format!(
                "key material must decode to {} bytes, got {}",
                KEY_SIZE,
                raw.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        Ok(Self::from_bytes(bytes))
    }

    /// Encoded form sent to the peer.
    ///
    /// # Security
    ///
    /// This is the secret key. It is sent in the clear during the
    /// handshake; callers must not log it.
    pub fn encode(&self) -> Zeroizing<String> {
        Zeroizing::new(URL_SAFE.encode(*self.to_bytes()))
    }

    /// Concatenated raw key bytes.
    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        out[..HALF_KEY_SIZE].copy_from_slice(&self.signing);
        out[HALF_KEY_SIZE..].copy_from_slice(&self.encryption);
        out
    }

    pub(crate) fn signing_key(&self) -> &[u8; HALF_KEY_SIZE] {
        &self.signing
    }

    pub(crate) fn encryption_key(&self) -> &[u8; HALF_KEY_SIZE] {
        &self.encryption
    }
}

impl std::fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TunnelKey(..)")
    }
}
