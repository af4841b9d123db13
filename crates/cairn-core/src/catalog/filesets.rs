use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::catalog::schema::{FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};
use crate::error::{CairnError, Result};
use crate::volume::fileset::{FileKind, FileRecord};
use crate::volume::VolumeName;

/// (id, timestamp) of every fileset, newest first.
pub fn fileset_times(conn: &Connection) -> Result<Vec<(i64, DateTime<Utc>)>> {
    let mut stmt = conn.prepare("SELECT id, timestamp FROM filesets ORDER BY timestamp DESC")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
    let mut times = Vec::new();
    for row in rows {
        let (id, ts) = row?;
        times.push((id, from_unix(ts)?));
    }
    Ok(times)
}

/// Resolve a time bound and/or version indices to fileset ids, newest first.
///
/// Version index 0 is the newest fileset. A time bound selects every fileset
/// at or before that instant. With neither given, all filesets are returned.
pub fn get_fileset_ids(
    conn: &Connection,
    time: Option<DateTime<Utc>>,
    versions: &[usize],
) -> Result<Vec<i64>> {
    let all = fileset_times(conn)?;

    let mut selected: Vec<i64> = Vec::new();
    if versions.is_empty() && time.is_none() {
        selected.extend(all.iter().map(|(id, _)| *id));
    } else {
        for &version in versions {
            if let Some((id, _)) = all.get(version) {
                selected.push(*id);
            }
        }
        if let Some(bound) = time {
            for (id, ts) in &all {
                if *ts <= bound && !selected.contains(id) {
                    selected.push(*id);
                }
            }
        }
    }

    // newest first, deduplicated
    let order: Vec<i64> = all.iter().map(|(id, _)| *id).collect();
    selected.sort_by_key(|id| order.iter().position(|o| o == id));
    selected.dedup();
    Ok(selected)
}

/// Files referenced by no fileset. Must be zero before purge/compact begin.
pub fn count_orphan_files(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM files \
         WHERE id NOT IN (SELECT file_id FROM fileset_entries)",
        [],
        |row| row.get(0),
    )?)
}

/// Find a fileset timestamp >= `t_original` whose second is not already taken
/// by a fileset row or a live remote dfileset name.
///
/// The result must stay strictly below the next-newer fileset's timestamp;
/// running out of the window is an invariant error requiring operator action.
pub fn probe_unused_filename(
    conn: &Connection,
    t_original: DateTime<Utc>,
    t_next: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    let mut taken: HashSet<i64> = HashSet::new();

    let mut stmt = conn.prepare("SELECT timestamp FROM filesets")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    for ts in rows {
        taken.insert(ts?);
    }

    let mut stmt = conn.prepare(
        "SELECT name FROM remote_volumes WHERE kind = 'dfileset' AND state != 'deleted'",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for name in rows {
        if let Ok(parsed) = VolumeName::parse(&name?) {
            taken.insert(parsed.timestamp.timestamp());
        }
    }

    let limit = t_next.map(|t| t.timestamp());
    let mut candidate = t_original.timestamp();
    // the original fileset's own timestamp is taken; any probe that needs a
    // new second starts one above it
    while taken.contains(&candidate) {
        candidate += 1;
        if let Some(limit) = limit {
            if candidate >= limit {
                return Err(CairnError::TimestampCollision {
                    candidate: t_original.timestamp(),
                    limit,
                });
            }
        }
    }
    from_unix(candidate)
}

/// Clone a fileset's membership into a fresh mutable fileset row.
/// The clone keeps the source timestamp and has no volume yet.
pub fn create_temporary_fileset(
    conn: &Connection,
    operation_id: i64,
    source_fileset_id: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO filesets(operation_id, volume_id, is_full_backup, timestamp) \
         SELECT ?1, NULL, is_full_backup, timestamp FROM filesets WHERE id = ?2",
        params![operation_id, source_fileset_id],
    )?;
    let temp_id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO fileset_entries(fileset_id, file_id, last_modified) \
         SELECT ?1, file_id, last_modified FROM fileset_entries WHERE fileset_id = ?2",
        params![temp_id, source_fileset_id],
    )?;
    Ok(temp_id)
}

/// (file_id, path) of every member of a fileset.
pub fn list_fileset_entries(conn: &Connection, fileset_id: i64) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT f.id, f.path FROM fileset_entries fe \
         JOIN files f ON f.id = fe.file_id \
         WHERE fe.fileset_id = ?1 ORDER BY f.path",
    )?;
    let rows = stmt.query_map(params![fileset_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

/// Remove the given members from a fileset. Returns the number removed.
pub fn remove_fileset_entries(
    conn: &Connection,
    fileset_id: i64,
    file_ids: &[i64],
) -> Result<usize> {
    let mut removed = 0;
    let mut stmt =
        conn.prepare("DELETE FROM fileset_entries WHERE fileset_id = ?1 AND file_id = ?2")?;
    for file_id in file_ids {
        removed += stmt.execute(params![fileset_id, file_id])?;
    }
    Ok(removed)
}

/// Replace the original fileset with the (filtered) temporary clone.
///
/// The clone takes over the original's id so that fileset ids stay aligned
/// with timestamp order, gets the probed timestamp, and is bound to the new
/// dfileset volume. Returns the original's remote volume id, which the
/// caller transitions to `deleting`.
pub fn convert_to_permanent_fileset(
    conn: &Connection,
    temp_fileset_id: i64,
    original_fileset_id: i64,
    new_volume_id: i64,
    new_timestamp: DateTime<Utc>,
) -> Result<i64> {
    let old_volume_id: i64 = conn
        .query_row(
            "SELECT volume_id FROM filesets WHERE id = ?1",
            params![original_fileset_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            CairnError::Other(format!(
                "fileset {original_fileset_id} vanished during purge"
            ))
        })?;

    conn.execute(
        "DELETE FROM filesets WHERE id = ?1",
        params![original_fileset_id],
    )?;
    conn.execute(
        "DELETE FROM fileset_entries WHERE fileset_id = ?1",
        params![original_fileset_id],
    )?;
    conn.execute(
        "UPDATE filesets SET id = ?1, volume_id = ?2, timestamp = ?3 WHERE id = ?4",
        params![
            original_fileset_id,
            new_volume_id,
            new_timestamp.timestamp(),
            temp_fileset_id
        ],
    )?;
    conn.execute(
        "UPDATE fileset_entries SET fileset_id = ?1 WHERE fileset_id = ?2",
        params![original_fileset_id, temp_fileset_id],
    )?;
    Ok(old_volume_id)
}

/// Remove fileset rows whose timestamps appear in the set.
/// Returns the now-orphaned dfileset volumes as (volume_id, name) so callers
/// can transition them to `deleting`.
pub fn drop_filesets_from_table(
    conn: &Connection,
    timestamps: &[DateTime<Utc>],
) -> Result<Vec<(i64, String)>> {
    let mut orphaned = Vec::new();
    for ts in timestamps {
        let mut stmt = conn.prepare(
            "SELECT fs.id, rv.id, rv.name FROM filesets fs \
             JOIN remote_volumes rv ON rv.id = fs.volume_id \
             WHERE fs.timestamp = ?1",
        )?;
        let rows = stmt.query_map(params![ts.timestamp()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (fileset_id, volume_id, name) = row?;
            conn.execute(
                "DELETE FROM fileset_entries WHERE fileset_id = ?1",
                params![fileset_id],
            )?;
            conn.execute("DELETE FROM filesets WHERE id = ?1", params![fileset_id])?;
            orphaned.push((volume_id, name));
        }
    }
    Ok(orphaned)
}

/// Delete file rows no fileset references, then blockset rows no file
/// references. Unreferenced blocks stay: reclaiming them is compact's job.
pub fn prune_unreferenced(conn: &Connection) -> Result<(usize, usize)> {
    let files = conn.execute(
        "DELETE FROM files WHERE id NOT IN (SELECT file_id FROM fileset_entries)",
        [],
    )?;
    let blocksets = conn.execute(
        "DELETE FROM blocksets WHERE \
         id NOT IN (SELECT blockset_id FROM files WHERE blockset_id > 0) AND \
         id NOT IN (SELECT metadata_id FROM files WHERE metadata_id > 0)",
        [],
    )?;
    conn.execute(
        "DELETE FROM blockset_entries WHERE blockset_id NOT IN (SELECT id FROM blocksets)",
        [],
    )?;
    Ok((files, blocksets))
}

/// Create a fileset row (used by backup and by tests).
pub fn create_fileset(
    conn: &Connection,
    operation_id: i64,
    volume_id: i64,
    is_full_backup: bool,
    timestamp: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO filesets(operation_id, volume_id, is_full_backup, timestamp) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            operation_id,
            volume_id,
            is_full_backup as i64,
            timestamp.timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn add_fileset_entry(
    conn: &Connection,
    fileset_id: i64,
    file_id: i64,
    last_modified: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO fileset_entries(fileset_id, file_id, last_modified) \
         VALUES (?1, ?2, ?3)",
        params![fileset_id, file_id, last_modified.timestamp()],
    )?;
    Ok(())
}

/// Intern a block. Returns (block_id, was_new).
pub fn register_block(conn: &Connection, hash: &str, size: u32, volume_id: i64) -> Result<(i64, bool)> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM blocks WHERE hash = ?1 AND size = ?2",
            params![hash, size],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok((id, false));
    }
    conn.execute(
        "INSERT INTO blocks(hash, size, volume_id) VALUES (?1, ?2, ?3)",
        params![hash, size, volume_id],
    )?;
    Ok((conn.last_insert_rowid(), true))
}

/// Intern a blockset with its ordered members. Returns (blockset_id, was_new).
pub fn register_blockset(
    conn: &Connection,
    length: u64,
    full_hash: &str,
    block_ids: &[i64],
) -> Result<(i64, bool)> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM blocksets WHERE length = ?1 AND full_hash = ?2",
            params![length as i64, full_hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok((id, false));
    }
    conn.execute(
        "INSERT INTO blocksets(length, full_hash) VALUES (?1, ?2)",
        params![length as i64, full_hash],
    )?;
    let blockset_id = conn.last_insert_rowid();
    let mut stmt = conn.prepare(
        "INSERT INTO blockset_entries(blockset_id, idx, block_id) VALUES (?1, ?2, ?3)",
    )?;
    for (idx, block_id) in block_ids.iter().enumerate() {
        stmt.execute(params![blockset_id, idx as i64, block_id])?;
    }
    Ok((blockset_id, true))
}

/// Intern a file row. Returns its id.
pub fn register_file(
    conn: &Connection,
    path: &str,
    blockset_id: i64,
    metadata_id: i64,
) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM files WHERE path = ?1 AND blockset_id = ?2 AND metadata_id = ?3",
            params![path, blockset_id, metadata_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO files(path, blockset_id, metadata_id) VALUES (?1, ?2, ?3)",
        params![path, blockset_id, metadata_id],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Build the `filelist.json` records for a fileset from catalog rows.
pub fn fileset_file_records(conn: &Connection, fileset_id: i64) -> Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(
        "SELECT f.path, f.blockset_id, fe.last_modified, \
                cb.length, cb.full_hash, mb.full_hash \
         FROM fileset_entries fe \
         JOIN files f ON f.id = fe.file_id \
         LEFT JOIN blocksets cb ON cb.id = f.blockset_id \
         LEFT JOIN blocksets mb ON mb.id = f.metadata_id \
         WHERE fe.fileset_id = ?1 ORDER BY f.path",
    )?;
    let rows = stmt.query_map(params![fileset_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<i64>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (path, blockset_id, last_modified, length, content_hash, meta_hash) = row?;
        let (kind, size, hash) = match blockset_id {
            FOLDER_BLOCKSET_ID => (FileKind::Folder, 0, None),
            SYMLINK_BLOCKSET_ID => (FileKind::Symlink, 0, None),
            _ => (FileKind::File, length.unwrap_or(0), content_hash),
        };
        records.push(FileRecord {
            path,
            kind,
            size,
            hash,
            metahash: meta_hash,
            time: last_modified,
        });
    }
    Ok(records)
}

/// The fileset row bound to a given remote volume, if any.
pub fn fileset_by_volume(conn: &Connection, volume_id: i64) -> Result<Option<(i64, DateTime<Utc>, bool)>> {
    let row = conn
        .query_row(
            "SELECT id, timestamp, is_full_backup FROM filesets WHERE volume_id = ?1",
            params![volume_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            },
        )
        .optional()?;
    row.map(|(id, ts, full)| Ok((id, from_unix(ts)?, full))).transpose()
}

pub(super) fn from_unix(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| CairnError::Other(format!("timestamp {ts} out of range")))
}
