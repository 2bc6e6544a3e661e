//! Authenticated, versioned encryption tokens.
//!
//! Layout before encoding:
//!
//! ```text
//! +---------+---------------+----------+----------------------+-------------+
//! | 0x80    | timestamp u64 | IV (16)  | AES-128-CBC (PKCS7)  | HMAC-SHA256 |
//! | version | big-endian    |          | ciphertext           | (32)        |
//! +---------+---------------+----------+----------------------+-------------+
//! ```
//!
//! The HMAC covers everything before it. The whole token is URL-safe base64
//! with padding, so it never contains the `\n` that delimits tokens on a stream.

use aes::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    KeyIvInit,
};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::TunnelKey;
use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Version marker, first byte of every token.
pub const TOKEN_VERSION: u8 = 0x80;

/// Size of the CBC initialization vector.
pub const IV_SIZE: usize = 16;

/// Size of the HMAC-SHA256 tag.
pub const MAC_SIZE: usize = 32;

/// How far in the future a token timestamp may be when freshness is checked.
pub const MAX_CLOCK_SKEW_SECS: u64 = 60;

const BLOCK_SIZE: usize = 16;
const TIMESTAMP_SIZE: usize = 8;
const HEADER_SIZE: usize = 1 + TIMESTAMP_SIZE + IV_SIZE;

/// Encoded length of the token produced for a plaintext of `plaintext_len` bytes.
pub const fn sealed_len(plaintext_len: usize) -> usize {
    let padded = (plaintext_len / BLOCK_SIZE + 1) * BLOCK_SIZE;
    let raw = HEADER_SIZE + padded + MAC_SIZE;
    raw.div_ceil(3) * 4
}

fn mac(key: &TunnelKey) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(key.signing_key()).expect("HMAC accepts any key length")
}

/// Encrypt and authenticate `plaintext` with an explicit timestamp and IV.
pub fn seal(key: &TunnelKey, plaintext: &[u8], timestamp: u64, iv: [u8; IV_SIZE]) -> Vec<u8> {
    let ciphertext = Aes128CbcEnc::new(
        GenericArray::from_slice(key.encryption_key()),
        GenericArray::from_slice(&iv),
    )
    .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut raw = Vec::with_capacity(HEADER_SIZE + ciphertext.len() + MAC_SIZE);
    raw.push(TOKEN_VERSION);
    raw.extend_from_slice(&timestamp.to_be_bytes());
    raw.extend_from_slice(&iv);
    raw.extend_from_slice(&ciphertext);

    let tag = mac(key).chain_update(&raw).finalize().into_bytes();
    raw.extend_from_slice(&tag);

    URL_SAFE.encode(raw).into_bytes()
}

/// Verify and decrypt a token.
///
/// `ttl_secs` enables the freshness check against `now` (Unix seconds).
pub fn open(key: &TunnelKey, token: &[u8], ttl_secs: Option<u64>, now: u64) -> Result<Vec<u8>> {
    let raw = URL_SAFE
        .decode(token)
        .map_err(|_| Error::integrity("token is not valid base64"))?;

    if raw.len() < HEADER_SIZE + BLOCK_SIZE + MAC_SIZE
        || (raw.len() - HEADER_SIZE - MAC_SIZE) % BLOCK_SIZE != 0
    {
        return Err(Error::integrity(format!(
            "token has invalid length {}",
            raw.len()
        )));
    }
    if raw[0] != TOKEN_VERSION {
        return Err(Error::integrity(format!(
            "unknown token version 0x{:02x}",
            raw[0]
        )));
    }

    let (signed, tag) = raw.split_at(raw.len() - MAC_SIZE);
    mac(key)
        .chain_update(signed)
        .verify_slice(tag)
        .map_err(|_| Error::integrity("authentication tag mismatch"))?;

    let mut ts = [0u8; TIMESTAMP_SIZE];
    ts.copy_from_slice(&signed[1..1 + TIMESTAMP_SIZE]);
    let timestamp = u64::from_be_bytes(ts);

    if let Some(ttl) = ttl_secs {
        if timestamp.saturating_add(ttl) < now {
            return Err(Error::integrity("token expired"));
        }
        if timestamp > now.saturating_add(MAX_CLOCK_SKEW_SECS) {
            return Err(Error::integrity("token timestamp is in the future"));
        }
    }

    let iv = &signed[1 + TIMESTAMP_SIZE..HEADER_SIZE];
    let ciphertext = &signed[HEADER_SIZE..];

    Aes128CbcDec::new(
        GenericArray::from_slice(key.encryption_key()),
        GenericArray::from_slice(iv),
    )
    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
    .map_err(|_| Error::integrity("invalid padding"))
}

/// Timestamp embedded in a token, without verifying it.
pub fn peek_timestamp(token: &[u8]) -> Option<u64> {
    let raw = URL_SAFE.decode(token).ok()?;
    if raw.len() < HEADER_SIZE || raw[0] != TOKEN_VERSION {
        return None;
    }
    let mut ts = [0u8; TIMESTAMP_SIZE];
    ts.copy_from_slice(&raw[1..1 + TIMESTAMP_SIZE]);
    Some(u64::from_be_bytes(ts))
}
