use serde::{Deserialize, Serialize};

use crate::crypto::block_id::BlockId;
use crate::error::{CairnError, Result};
use crate::volume::{VolumeReader, VolumeWriter, MANIFEST_ENTRY};

/// Entry name prefix for the per-dblock block list.
pub const VOL_PREFIX: &str = "vol/";
/// Entry name prefix for blocklist-hash entries (long blocksets in compact form).
pub const LIST_PREFIX: &str = "list/";

/// One block as recorded in a dindex volume's block list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBlockEntry {
    pub hash: String,
    pub size: u32,
}

/// Append the `vol/<dblock-name>` entry enumerating one dblock's blocks.
pub fn write_block_list(
    writer: &mut VolumeWriter,
    dblock_name: &str,
    blocks: &[IndexBlockEntry],
) -> Result<()> {
    writer.add_entry(format!("{VOL_PREFIX}{dblock_name}"), serde_json::to_vec(blocks)?);
    Ok(())
}

/// Append a `list/<blocklist-hash>` entry: the concatenated raw hashes of a
/// long blockset, keyed by the digest of that concatenation.
pub fn write_blocklist_entry(writer: &mut VolumeWriter, block_hashes: &[BlockId]) {
    let mut concatenated = Vec::with_capacity(block_hashes.len() * 32);
    for id in block_hashes {
        concatenated.extend_from_slice(&id.0);
    }
    let list_hash = BlockId::compute(&concatenated);
    writer.add_entry(format!("{LIST_PREFIX}{}", list_hash.to_base64()), concatenated);
}

/// Read every `vol/` entry of a dindex: (dblock name, its block list).
pub fn read_block_lists(reader: &VolumeReader) -> Result<Vec<(String, Vec<IndexBlockEntry>)>> {
    let mut lists = Vec::new();
    for (name, data) in reader.entries() {
        if let Some(dblock_name) = name.strip_prefix(VOL_PREFIX) {
            let blocks: Vec<IndexBlockEntry> = serde_json::from_slice(data)?;
            lists.push((dblock_name.to_string(), blocks));
        } else if !name.starts_with(LIST_PREFIX) && name != MANIFEST_ENTRY {
            return Err(CairnError::InvalidFormat(format!(
                "unexpected dindex entry: '{name}'"
            )));
        }
    }
    Ok(lists)
}
