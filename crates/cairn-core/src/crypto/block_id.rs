use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// Identifier of the block-hash algorithm, recorded in volume manifests
/// and in the catalog settings.
pub const BLOCK_HASH_ALGORITHM: &str = "blake2b-256";

/// Size of a block hash in bytes.
pub const BLOCK_HASH_SIZE: usize = 32;

/// Content digest of a block (BLAKE2b-256).
///
/// Rendered as unpadded base64url everywhere a textual form is needed:
/// catalog rows, dblock entry names, dindex block lists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub [u8; BLOCK_HASH_SIZE]);

impl BlockId {
    /// Compute the digest of a block's content.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Blake2bVar::new(BLOCK_HASH_SIZE).unwrap();
        hasher.update(data);
        let mut out = [0u8; BLOCK_HASH_SIZE];
        hasher.finalize_variable(&mut out).unwrap();
        BlockId(out)
    }

    pub fn to_base64(self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| CairnError::InvalidFormat(format!("invalid block hash '{s}': {e}")))?;
        let arr: [u8; BLOCK_HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| CairnError::InvalidFormat(format!("block hash '{s}' has wrong length")))?;
        Ok(BlockId(arr))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        assert_eq!(BlockId::compute(b"abc"), BlockId::compute(b"abc"));
        assert_ne!(BlockId::compute(b"abc"), BlockId::compute(b"abd"));
    }

    #[test]
    fn base64_roundtrip() {
        let id = BlockId::compute(b"some block content");
        let text = id.to_base64();
        assert_eq!(BlockId::from_base64(&text).unwrap(), id);
        // unpadded base64url: no '=' and url-safe alphabet only
        assert!(!text.contains('='));
        assert!(!text.contains('+'));
        assert!(!text.contains('/'));
    }

    #[test]
    fn from_base64_rejects_wrong_length() {
        assert!(BlockId::from_base64("AAAA").is_err());
        assert!(BlockId::from_base64("not!base64").is_err());
    }
}
