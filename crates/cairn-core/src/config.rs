use serde::{Deserialize, Serialize};

use crate::compress::Compression;
use crate::error::{CairnError, Result};

/// Default block size: 100 KiB.
pub fn default_blocksize() -> u32 {
    100 * 1024
}

/// Default target size for dblock volumes: 50 MiB.
pub fn default_volume_size() -> u32 {
    50 * 1024 * 1024
}

fn default_prefix() -> String {
    "cairn".to_string()
}

fn default_compact_threshold() -> f64 {
    20.0
}

fn default_compact_wasted_space() -> u64 {
    25 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CairnConfig {
    pub repository: RepositoryConfig,
    /// Path of the local catalog database file.
    pub catalog: String,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default = "default_blocksize")]
    pub blocksize: u32,
    /// Target size for dblock volumes before a new one is started.
    #[serde(default = "default_volume_size")]
    pub volume_size: u32,
    /// Filename prefix of every remote volume.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub compact: CompactConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl CairnConfig {
    /// Validate option ranges that would otherwise fail at awkward times.
    pub fn validate(&self) -> Result<()> {
        if self.blocksize == 0 {
            return Err(CairnError::Config("blocksize must be > 0".into()));
        }
        if (self.volume_size as u64) < self.blocksize as u64 {
            return Err(CairnError::Config(format!(
                "volume_size ({}) must be at least blocksize ({})",
                self.volume_size, self.blocksize
            )));
        }
        if self.prefix.is_empty() || self.prefix.contains('-') {
            return Err(CairnError::Config(format!(
                "prefix '{}' must be non-empty and must not contain '-'",
                self.prefix
            )));
        }
        if !(0.0..=100.0).contains(&self.compact.threshold_percent) {
            return Err(CairnError::Config(
                "compact.threshold_percent must be in 0..=100".into(),
            ));
        }
        Ok(())
    }

    pub fn compression(&self) -> Compression {
        Compression::from_algorithm(self.compression.algorithm, self.compression.zstd_level)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository location: bare path or `file://` URL.
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub mode: EncryptionMode,
    /// Passphrase; may also be supplied via the CLI/environment.
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    #[default]
    None,
    Aes256Gcm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_zstd_level() -> i32 {
    3
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::default(),
            zstd_level: default_zstd_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    #[default]
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactConfig {
    /// Rewrite a dblock volume when less than this percentage of it is still
    /// referenced.
    #[serde(default = "default_compact_threshold")]
    pub threshold_percent: f64,
    /// Rewrite a dblock volume when more than this many bytes of it are dead,
    /// regardless of the percentage.
    #[serde(default = "default_compact_wasted_space")]
    pub wasted_space_bytes: u64,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            threshold_percent: default_compact_threshold(),
            wasted_space_bytes: default_compact_wasted_space(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}
