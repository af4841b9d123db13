use std::io::Read;

use crate::config::CompressionAlgorithm;
use crate::error::{CairnError, Result};

/// Maximum decompressed container size (1 GiB).
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 1024 * 1024 * 1024;

/// Stream codec applied to a whole volume container.
///
/// Unlike per-entry schemes there is no inline tag byte: the codec is named
/// in the volume filename, so both sides always know which one to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Compression {
    pub fn from_algorithm(algorithm: CompressionAlgorithm, zstd_level: i32) -> Self {
        match algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd { level: zstd_level },
        }
    }

    /// Filename extension identifying this codec.
    pub fn ext(&self) -> &'static str {
        match self {
            Compression::None => "raw",
            Compression::Lz4 => "lz4",
            Compression::Zstd { .. } => "zst",
        }
    }

    /// Resolve a filename extension back to a codec.
    /// Zstd decoding ignores the level, so the default is fine for reads.
    pub fn from_ext(ext: &str) -> Result<Self> {
        match ext {
            "raw" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zst" => Ok(Compression::Zstd { level: 3 }),
            other => Err(CairnError::InvalidFormat(format!(
                "unknown compression extension: '{other}'"
            ))),
        }
    }
}

/// Compress a whole container stream.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Zstd { level } => zstd::bulk::compress(data, level)
            .map_err(|e| CairnError::Other(format!("zstd compress: {e}"))),
    }
}

/// Decompress a whole container stream.
pub fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => {
            if data.len() < 4 {
                return Err(CairnError::Decompression("lz4: payload too short".into()));
            }
            let uncompressed_size = u32::from_le_bytes(data[..4].try_into().unwrap()) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|e| CairnError::Decompression(format!("lz4: {e}")))
        }
        Compression::Zstd { .. } => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(data))
                .map_err(|e| CairnError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| CairnError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_codecs() {
        let payload = b"a container stream that is long enough to actually compress a little";
        for codec in [
            Compression::None,
            Compression::Lz4,
            Compression::Zstd { level: 3 },
        ] {
            let packed = compress(codec, payload).unwrap();
            let unpacked = decompress(codec, &packed).unwrap();
            assert_eq!(unpacked, payload);
        }
    }

    #[test]
    fn ext_roundtrip() {
        for codec in [
            Compression::None,
            Compression::Lz4,
            Compression::Zstd { level: 3 },
        ] {
            let back = Compression::from_ext(codec.ext()).unwrap();
            assert_eq!(back.ext(), codec.ext());
        }
        assert!(Compression::from_ext("zip").is_err());
    }

    #[test]
    fn rejects_lz4_bomb() {
        let mut bomb = (2u32 << 30).to_le_bytes().to_vec();
        bomb.extend_from_slice(&[0u8; 10]);
        assert!(decompress(Compression::Lz4, &bomb).is_err());
    }
}
