pub mod aes_gcm;
pub mod block_id;

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

use crate::error::Result;

/// Trait for encrypting and decrypting whole volume containers.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[nonce][ciphertext+tag]`.
    /// `aad` is authenticated but not encrypted (the volume filename).
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`.
    /// `aad` must match what was passed during encryption.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;

    /// Filename extension appended to encrypted volumes, if any.
    fn ext(&self) -> Option<&'static str>;
}

/// No-encryption engine.
pub struct PlaintextEngine;

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }

    fn ext(&self) -> Option<&'static str> {
        None
    }
}

/// Derive a 32-byte encryption key from a passphrase.
///
/// Key stretching via a password KDF is a concern of the outer key store;
/// the storage core only needs a deterministic digest of the secret.
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut hasher = Blake2bVar::new(32).unwrap();
    hasher.update(b"cairn volume key v1");
    hasher.update(passphrase.as_bytes());
    let mut key = [0u8; 32];
    hasher.finalize_variable(&mut key).unwrap();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic() {
        assert_eq!(derive_key("hunter2"), derive_key("hunter2"));
        assert_ne!(derive_key("hunter2"), derive_key("hunter3"));
    }

    #[test]
    fn plaintext_engine_passes_through() {
        let engine = PlaintextEngine;
        let data = b"not a secret";
        let out = engine.encrypt(data, b"aad").unwrap();
        assert_eq!(out, data);
        assert_eq!(engine.decrypt(&out, b"other").unwrap(), data);
        assert!(!engine.is_encrypting());
        assert!(engine.ext().is_none());
    }
}
