use rusqlite::{params, Connection};

use crate::error::{CairnError, Result};

/// Current catalog schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Sentinel blockset id marking a file row as a folder.
pub const FOLDER_BLOCKSET_ID: i64 = -100;
/// Sentinel blockset id marking a file row as a symlink.
pub const SYMLINK_BLOCKSET_ID: i64 = -200;
/// Sentinel metadata id for files without a metadata stream.
pub const NO_METADATA_ID: i64 = 0;

pub(super) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS operations (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS remote_volumes (
    id INTEGER PRIMARY KEY,
    operation_id INTEGER NOT NULL,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    size INTEGER,
    hash TEXT,
    state TEXT NOT NULL,
    delete_grace_time INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS blocks (
    id INTEGER PRIMARY KEY,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    volume_id INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS block_hash_size ON blocks(hash, size);
CREATE INDEX IF NOT EXISTS block_volume ON blocks(volume_id);
CREATE TABLE IF NOT EXISTS blocksets (
    id INTEGER PRIMARY KEY,
    length INTEGER NOT NULL,
    full_hash TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS blockset_identity ON blocksets(length, full_hash);
CREATE TABLE IF NOT EXISTS blockset_entries (
    blockset_id INTEGER NOT NULL,
    idx INTEGER NOT NULL,
    block_id INTEGER NOT NULL,
    PRIMARY KEY (blockset_id, idx)
);
CREATE INDEX IF NOT EXISTS blockset_entry_block ON blockset_entries(block_id);
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL,
    blockset_id INTEGER NOT NULL,
    metadata_id INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS file_identity ON files(path, blockset_id, metadata_id);
CREATE TABLE IF NOT EXISTS filesets (
    id INTEGER PRIMARY KEY,
    operation_id INTEGER NOT NULL,
    volume_id INTEGER,
    is_full_backup INTEGER NOT NULL DEFAULT 0,
    timestamp INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS fileset_entries (
    fileset_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    PRIMARY KEY (fileset_id, file_id)
);
CREATE INDEX IF NOT EXISTS fileset_entry_file ON fileset_entries(file_id);
CREATE TABLE IF NOT EXISTS index_block_links (
    index_volume_id INTEGER NOT NULL,
    block_volume_id INTEGER NOT NULL,
    PRIMARY KEY (index_volume_id, block_volume_id)
);
"#;

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Check that an existing catalog carries a schema version we understand.
pub(super) fn check_schema_version(conn: &Connection) -> Result<()> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match version {
        None => Err(CairnError::CatalogState(
            "missing schema_version setting".into(),
        )),
        Some(v) => {
            let parsed: u32 = v.parse().map_err(|_| {
                CairnError::CatalogState(format!("unparseable schema_version '{v}'"))
            })?;
            if parsed != SCHEMA_VERSION {
                return Err(CairnError::CatalogState(format!(
                    "unsupported schema version {parsed} (expected {SCHEMA_VERSION})"
                )));
            }
            Ok(())
        }
    }
}

pub(super) fn write_initial_settings(
    conn: &Connection,
    blocksize: u32,
    prefix: &str,
) -> Result<()> {
    let pairs: [(&str, String); 6] = [
        ("schema_version", SCHEMA_VERSION.to_string()),
        ("blocksize", blocksize.to_string()),
        (
            "block_hash",
            crate::crypto::block_id::BLOCK_HASH_ALGORITHM.to_string(),
        ),
        (
            "file_hash",
            crate::crypto::block_id::BLOCK_HASH_ALGORITHM.to_string(),
        ),
        ("prefix", prefix.to_string()),
        ("terminated_with_active_uploads", "false".to_string()),
    ];
    for (key, value) in pairs {
        conn.execute(
            "INSERT OR IGNORE INTO settings(key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }
    Ok(())
}
