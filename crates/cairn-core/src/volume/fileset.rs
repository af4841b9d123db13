use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};
use crate::volume::{VolumeReader, VolumeWriter};

/// Entry holding the fileset-level record.
pub const FILES_ENTRY: &str = "files";
/// Entry holding the JSON array of file records.
pub const FILELIST_ENTRY: &str = "filelist.json";

/// Fileset-level record stored in the `files` entry of a dfileset volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesetMeta {
    #[serde(rename = "IsFullBackup")]
    pub is_full_backup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
    Symlink,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Folder => "folder",
            FileKind::Symlink => "symlink",
        }
    }
}

/// One file record in `filelist.json`.
///
/// `hash` and `metahash` are the full-file digests of the content and
/// metadata blocksets; folders and symlinks carry no content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metahash: Option<String>,
    /// Modification time, unix seconds.
    pub time: i64,
}

/// Append the `files` and `filelist.json` entries to a dfileset container.
pub fn write_fileset_entries(
    writer: &mut VolumeWriter,
    meta: &FilesetMeta,
    records: &[FileRecord],
) -> Result<()> {
    writer.add_entry(FILES_ENTRY, serde_json::to_vec(meta)?);
    writer.add_entry(FILELIST_ENTRY, serde_json::to_vec(records)?);
    Ok(())
}

/// Read back both dfileset entries.
pub fn read_fileset_entries(reader: &VolumeReader) -> Result<(FilesetMeta, Vec<FileRecord>)> {
    let meta_data = reader
        .entry(FILES_ENTRY)
        .ok_or_else(|| CairnError::InvalidFormat("dfileset has no 'files' entry".into()))?;
    let meta: FilesetMeta = serde_json::from_slice(meta_data)?;

    let list_data = reader
        .entry(FILELIST_ENTRY)
        .ok_or_else(|| CairnError::InvalidFormat("dfileset has no 'filelist.json' entry".into()))?;
    let records: Vec<FileRecord> = serde_json::from_slice(list_data)?;

    Ok((meta, records))
}
