//! The per-session cipher context.

use std::time::Duration;

use zeroize::Zeroizing;

use crate::crypto::{token, KdfParams, SecureRandom, TunnelKey};
use crate::error::Result;

/// Holds the active tunnel key and performs token encryption/decryption.
///
/// The key only changes through [`CipherContext::replace_key`], which the
/// client calls once, after receiving the relay's key and before any data
/// frame is processed. The relay never replaces its key, so it can share
/// one context across sessions behind an `Arc`.
#[derive(Clone, Debug)]
pub struct CipherContext {
    key: TunnelKey,
    ttl: Option<Duration>,
}

impl CipherContext {
    /// Wrap an existing key.
    pub fn from_key(key: TunnelKey) -> Self {
        Self { key, ttl: None }
    }

    /// Derive the key from a password.
    pub fn from_password(password: &str, params: &KdfParams) -> Self {
        Self::from_key(params.derive(password))
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        Self::from_key(TunnelKey::generate())
    }

    /// Password-derived key when a password is given, random otherwise.
    pub fn new(password: Option<&str>, params: &KdfParams) -> Self {
        match password {
            Some(password) => Self::from_password(password, params),
            None => Self::generate(),
        }
    }

    /// Enable (or disable with `None`) the token freshness check on decrypt.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// The freshness window, if any.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Encrypt one message into a self-contained token.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        token::seal(&self.key, plaintext, unix_now(), SecureRandom::iv())
    }

    /// Verify and decrypt one token.
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>> {
        token::open(
            &self.key,
            token,
            self.ttl.map(|ttl| ttl.as_secs()),
            unix_now(),
        )
    }

    /// Adopt the key material the relay sent in its key frame.
    pub fn replace_key(&mut self, encoded: &[u8]) -> Result<()> {
        self.key = TunnelKey::decode(encoded)?;
        Ok(())
    }

    /// Encoded key, as sent to the client in the key frame.
    pub fn encoded_key(&self) -> Zeroizing<String> {
        self.key.encode()
    }

    /// Short non-secret identifier for the active key, safe to log.
    pub fn key_fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(*self.key.to_bytes());
        hex::encode(&digest[..8])
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn fast_params() -> KdfParams {
        KdfParams::new(b"test-salt".to_vec(), 1_000).unwrap()
    }

    #[test]
    fn test_round_trip_lengths() {
        let ctx = CipherContext::generate();
        for len in [0usize, 1, 2, 15, 16, 17, 255, 1024, 4096] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let token = ctx.encrypt(&plaintext);
            assert_eq!(ctx.decrypt(&token).unwrap(), plaintext, "len {}", len);
        }
    }

    #[test]
    fn test_random_iv_per_token() {
        let ctx = CipherContext::generate();
        assert_ne!(ctx.encrypt(b"same"), ctx.encrypt(b"same"));
    }

    #[test]
    fn test_password_contexts_interoperate() {
        let a = CipherContext::from_password("hunter2", &fast_params());
        let b = CipherContext::from_password("hunter2", &fast_params());
        assert_eq!(a.encoded_key(), b.encoded_key());
        let token = a.encrypt(b"hello");
        assert_eq!(b.decrypt(&token).unwrap(), b"hello");

        let c = CipherContext::from_password("hunter3", &fast_params());
        assert!(c.decrypt(&token).is_err());
    }

    #[test]
    fn test_new_picks_source() {
        let params = fast_params();
        let derived = CipherContext::new(Some("pw"), &params);
        assert_eq!(
            derived.encoded_key(),
            CipherContext::from_password("pw", &params).encoded_key()
        );
        let random = CipherContext::new(None, &params);
        assert_ne!(random.encoded_key(), derived.encoded_key());
    }

    #[test]
    fn test_tamper_detection_every_bit() {
        let ctx = CipherContext::generate();
        for len in [0usize, 1, 16, 33] {
            let plaintext = vec![0xab; len];
            let token = ctx.encrypt(&plaintext);
            for byte in 0..token.len() {
                for bit in 0..8 {
                    let mut tampered = token.clone();
                    tampered[byte] ^= 1 << bit;
                    match ctx.decrypt(&tampered) {
                        Err(Error::Integrity(_)) => {}
                        other => panic!(
                            "len {} byte {} bit {}: expected integrity error, got {:?}",
                            len, byte, bit, other
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn test_replace_key() {
        let server = CipherContext::generate();
        let mut client = CipherContext::generate();

        let token = server.encrypt(b"example.com:443");
        assert!(client.decrypt(&token).is_err());

        client.replace_key(server.encoded_key().as_bytes()).unwrap();
        assert_eq!(client.decrypt(&token).unwrap(), b"example.com:443");
        assert_eq!(client.key_fingerprint(), server.key_fingerprint());
    }

    #[test]
    fn test_replace_key_rejects_garbage() {
        let mut ctx = CipherContext::generate();
        let before = ctx.encoded_key();
        assert!(matches!(ctx.replace_key(b"short"), Err(Error::Handshake(_))));
        // Failed replacement leaves the old key in place
        assert_eq!(ctx.encoded_key(), before);
    }

    #[test]
    fn test_ttl_fresh_token_accepted() {
        let ctx = CipherContext::generate().with_ttl(Some(Duration::from_secs(30)));
        assert_eq!(ctx.ttl(), Some(Duration::from_secs(30)));
        let token = ctx.encrypt(b"now");
        assert_eq!(ctx.decrypt(&token).unwrap(), b"now");
    }

    #[test]
    fn test_ttl_stale_token_rejected() {
        let ctx = CipherContext::generate().with_ttl(Some(Duration::from_secs(30)));
        let stale = token::seal(&ctx.key, b"old", unix_now() - 3_600, [0u8; token::IV_SIZE]);
        assert!(matches!(ctx.decrypt(&stale), Err(Error::Integrity(_))));

        let lenient = ctx.clone().with_ttl(None);
        assert_eq!(lenient.decrypt(&stale).unwrap(), b"old");
    }
}
