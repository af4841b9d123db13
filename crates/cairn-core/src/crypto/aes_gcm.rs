use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

use super::CryptoEngine;
use crate::error::{CairnError, Result};

/// Bytes of random nonce prepended to every encrypted volume.
const NONCE_LEN: usize = 12;
/// Bytes of GCM authentication tag appended by the cipher.
const TAG_LEN: usize = 16;

/// AES-256-GCM engine for whole-volume encryption.
///
/// Encrypted blobs carry a fresh random nonce up front; the tag sits at the
/// end of the ciphertext where the aead crate leaves it. The volume filename
/// travels as associated data, so a blob renamed on the backend fails to
/// open.
pub struct Aes256GcmEngine {
    cipher: Aes256Gcm,
}

impl Aes256GcmEngine {
    pub fn new(encryption_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(encryption_key)),
        }
    }
}

impl CryptoEngine for Aes256GcmEngine {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_LEN] = rand::random();

        let mut blob = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        blob.extend_from_slice(&nonce);

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CairnError::Other(format!("volume encryption failed: {e}")))?;
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        // shortest valid blob: nonce + empty ciphertext + tag
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CairnError::DecryptionFailed);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload { msg: sealed, aad },
            )
            .map_err(|_| CairnError::DecryptionFailed)
    }

    fn is_encrypting(&self) -> bool {
        true
    }

    fn ext(&self) -> Option<&'static str> {
        Some("aes")
    }
}
