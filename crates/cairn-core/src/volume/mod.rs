pub mod fileset;
pub mod index;
pub mod name;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compress;
use crate::crypto::block_id::BLOCK_HASH_ALGORITHM;
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};

pub use name::{VolumeKind, VolumeName};

/// Magic bytes at the start of every volume container (before compression).
pub const VOLUME_MAGIC: &[u8; 8] = b"CAIRNVOL";
/// Container format version.
pub const VOLUME_VERSION: u8 = 1;
/// Size of the container header (magic + version byte).
pub const CONTAINER_HEADER_SIZE: usize = 9;

/// Name of the manifest entry present in every volume.
pub const MANIFEST_ENTRY: &str = "manifest";

/// The JSON manifest stored as the first entry of every volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeManifest {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
    #[serde(rename = "Encoding")]
    pub encoding: String,
    #[serde(rename = "Blocksize")]
    pub blocksize: u32,
    #[serde(rename = "BlockHash")]
    pub block_hash: String,
    #[serde(rename = "FileHash")]
    pub file_hash: String,
    #[serde(rename = "AppVersion")]
    pub app_version: String,
}

impl VolumeManifest {
    pub fn new(blocksize: u32, encoding: &str) -> Self {
        Self {
            version: VOLUME_VERSION as u32,
            created: Utc::now(),
            encoding: encoding.to_string(),
            blocksize,
            block_hash: BLOCK_HASH_ALGORITHM.to_string(),
            file_hash: BLOCK_HASH_ALGORITHM.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One row of the container's trailing entry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    name: String,
    offset: u64,
    length: u64,
}

/// Accumulates named entries and serializes them as a container:
/// `magic | version | entry payloads | entry table | table_len (u32 LE)`,
/// the whole stream compressed and then wrapped by the encryption engine.
pub struct VolumeWriter {
    entries: Vec<(String, Vec<u8>)>,
    content_size: u64,
}

impl VolumeWriter {
    /// Start a container whose first entry is the JSON manifest.
    pub fn new(manifest: &VolumeManifest) -> Result<Self> {
        let manifest_bytes = serde_json::to_vec(manifest)?;
        let mut writer = Self {
            entries: Vec::new(),
            content_size: 0,
        };
        writer.add_entry(MANIFEST_ENTRY, manifest_bytes);
        Ok(writer)
    }

    pub fn add_entry(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.content_size += data.len() as u64;
        self.entries.push((name.into(), data));
    }

    /// Total payload bytes added so far (used to decide when a dblock is full).
    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    /// Number of entries, including the manifest.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Assemble, compress, and encrypt the container.
    /// The volume filename is the authenticated associated data, binding the
    /// blob to its name.
    pub fn finish(self, name: &VolumeName, crypto: &dyn CryptoEngine) -> Result<Vec<u8>> {
        let mut archive: Vec<u8> =
            Vec::with_capacity(CONTAINER_HEADER_SIZE + self.content_size as usize + 1024);
        archive.extend_from_slice(VOLUME_MAGIC);
        archive.push(VOLUME_VERSION);

        let mut table: Vec<EntryRecord> = Vec::with_capacity(self.entries.len());
        for (entry_name, data) in &self.entries {
            table.push(EntryRecord {
                name: entry_name.clone(),
                offset: archive.len() as u64,
                length: data.len() as u64,
            });
            archive.extend_from_slice(data);
        }

        let table_bytes = rmp_serde::to_vec(&table)?;
        let table_len = table_bytes.len() as u32;
        archive.extend_from_slice(&table_bytes);
        archive.extend_from_slice(&table_len.to_le_bytes());

        let compressed = compress::compress(name.compression, &archive)?;
        crypto.encrypt(&compressed, name.to_string().as_bytes())
    }
}

/// Decoded volume container.
pub struct VolumeReader {
    entries: Vec<(String, Vec<u8>)>,
}

impl VolumeReader {
    /// Decrypt, decompress, and parse a container downloaded as `data`.
    /// `name` must be the blob's filename: it selects the compression codec
    /// and is the authenticated associated data.
    pub fn open(name: &str, data: &[u8], crypto: &dyn CryptoEngine) -> Result<Self> {
        let parsed = VolumeName::parse(name)?;
        let compressed = crypto.decrypt(data, name.as_bytes())?;
        let archive = compress::decompress(parsed.compression, &compressed)?;

        if archive.len() < CONTAINER_HEADER_SIZE + 4 {
            return Err(CairnError::InvalidFormat("container too small".into()));
        }
        if &archive[..8] != VOLUME_MAGIC {
            return Err(CairnError::InvalidFormat("invalid container magic".into()));
        }
        if archive[8] != VOLUME_VERSION {
            return Err(CairnError::InvalidFormat(format!(
                "unsupported container version: {}",
                archive[8]
            )));
        }

        let len_offset = archive.len() - 4;
        let table_len = u32::from_le_bytes(archive[len_offset..].try_into().unwrap()) as usize;
        if table_len + 4 > archive.len() - CONTAINER_HEADER_SIZE {
            return Err(CairnError::InvalidFormat(
                "invalid container entry table length".into(),
            ));
        }
        let table_start = len_offset - table_len;
        let table: Vec<EntryRecord> = rmp_serde::from_slice(&archive[table_start..len_offset])?;

        let mut entries = Vec::with_capacity(table.len());
        for record in table {
            let start = record.offset as usize;
            let end = start
                .checked_add(record.length as usize)
                .ok_or_else(|| CairnError::InvalidFormat("entry overflows container".into()))?;
            if start < CONTAINER_HEADER_SIZE || end > table_start {
                return Err(CairnError::InvalidFormat(format!(
                    "entry '{}' lies outside the payload region",
                    record.name
                )));
            }
            entries.push((record.name, archive[start..end].to_vec()));
        }

        Ok(Self { entries })
    }

    /// The parsed JSON manifest entry.
    pub fn manifest(&self) -> Result<VolumeManifest> {
        let data = self
            .entry(MANIFEST_ENTRY)
            .ok_or_else(|| CairnError::InvalidFormat("container has no manifest entry".into()))?;
        Ok(serde_json::from_slice(data)?)
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, d)| (n.as_str(), d.as_slice()))
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
