//! Cryptographic primitives for the tunnel.
//!
//! This module provides:
//! - PBKDF2-HMAC-SHA256 password-based key derivation
//! - Authenticated tokens (AES-128-CBC + HMAC-SHA256, timestamped)
//! - The [`CipherContext`] every session encrypts and decrypts through
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod cipher;
mod kdf;
mod keys;
mod random;
pub mod token;

pub use cipher::CipherContext;
pub use kdf::{KdfParams, DEFAULT_ITERATIONS, DEFAULT_SALT};
pub use keys::{TunnelKey, ENCODED_KEY_LEN};
pub use random::SecureRandom;

/// Size of the tunnel key in bytes (256 bits: signing half + encryption half)
pub const KEY_SIZE: usize = 32;

/// Size of each key half in bytes
pub const HALF_KEY_SIZE: usize = KEY_SIZE / 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_key_transfer() {
        // Relay derives its key from a password (done once)
        let params = KdfParams::new(DEFAULT_SALT, 1_000).unwrap();
        let relay = CipherContext::from_password("shared secret", &params);

        // Client starts with a throwaway key and adopts the relay's
        let mut client = CipherContext::generate();
        client.replace_key(relay.encoded_key().as_bytes()).unwrap();

        let declared = client.encrypt(b"example.com:443");
        assert_eq!(relay.decrypt(&declared).unwrap(), b"example.com:443");

        let reply = relay.encrypt(b"HTTP/1.1 200 OK\r\n");
        assert_eq!(client.decrypt(&reply).unwrap(), b"HTTP/1.1 200 OK\r\n");
    }
}
