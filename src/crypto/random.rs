//! OS entropy for tunnel keys and token IVs.

use rand::RngCore;
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::crypto::token::IV_SIZE;
use crate::crypto::KEY_SIZE;

/// Source of the randomness every token and generated key depends on.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill `dest` from the operating system's entropy source.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// A fresh IV for one token. Never reused across tokens.
    pub fn iv() -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        Self::fill(&mut iv);
        iv
    }

    /// Raw material for a generated tunnel key, wiped when dropped.
    pub fn key_material() -> Zeroizing<[u8; KEY_SIZE]> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        Self::fill(&mut *bytes);
        bytes
    }
}
