//! Password-based key derivation.
//!
//! PBKDF2-HMAC-SHA256 stretches a shared password into the 32 bytes of
//! tunnel key material (signing half + encryption half).

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::crypto::{TunnelKey, KEY_SIZE};
use crate::error::{Error, Result};

/// Salt used by every deployment that does not configure its own.
///
/// Kept so that password-derived keys stay compatible with existing
/// deployments. Configure a per-deployment salt where possible.
pub const DEFAULT_SALT: &[u8] = b"vpn_salt_12345";

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Parameters for deriving a [`TunnelKey`] from a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    salt: Vec<u8>,
    iterations: u32,
}

impl KdfParams {
    /// Create parameters with an explicit salt and iteration count.
    pub fn new(salt: impl Into<Vec<u8>>, iterations: u32) -> Result<Self> {
        let salt = salt.into();
        if salt.is_empty() {
            return Err(Error::config("KDF salt cannot be empty"));
        }
        if iterations == 0 {
            return Err(Error::config("KDF iteration count must be positive"));
        }
        Ok(Self { salt, iterations })
    }

    /// Parse a hex-encoded salt, as stored in configuration files.
    pub fn from_hex_salt(salt_hex: &str, iterations: u32) -> Result<Self> {
        let salt = hex::decode(salt_hex.trim())
            .map_err(|e| Error::config(format!("invalid hex salt: {}", e)))?;
        Self::new(salt, iterations)
    }

    /// The salt bytes.
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// The iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Hex form of the salt, for writing configuration files.
    pub fn salt_hex(&self) -> String {
        hex::encode(&self.salt)
    }

    /// Whether these parameters still use the shared legacy salt.
    pub fn uses_default_salt(&self) -> bool {
        self.salt == DEFAULT_SALT
    }

    /// Derive tunnel key material from `password`.
    pub fn derive(&self, password: &str) -> TunnelKey {
        let mut okm = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &self.salt, self.iterations, &mut okm);
        TunnelKey::from_bytes(okm)
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: DEFAULT_SALT.to_vec(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}
