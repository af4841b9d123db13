use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CairnError, Result};
use crate::volume::VolumeKind;

/// Lifecycle state of a remote volume's catalog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Temporary => "temporary",
            VolumeState::Uploading => "uploading",
            VolumeState::Uploaded => "uploaded",
            VolumeState::Verified => "verified",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "temporary" => Ok(VolumeState::Temporary),
            "uploading" => Ok(VolumeState::Uploading),
            "uploaded" => Ok(VolumeState::Uploaded),
            "verified" => Ok(VolumeState::Verified),
            "deleting" => Ok(VolumeState::Deleting),
            "deleted" => Ok(VolumeState::Deleted),
            other => Err(CairnError::InvalidFormat(format!(
                "unknown volume state: '{other}'"
            ))),
        }
    }

    /// Whether a transition from `self` to `to` is permitted.
    ///
    /// Forward edges: temporary -> uploading -> uploaded -> verified.
    /// Abort edges: temporary/uploading -> deleting.
    /// Retire edges: uploaded/verified -> deleting.
    /// deleting -> deleted; deleted is terminal. Same-state updates are
    /// allowed so size and hash can be refreshed without a state change.
    pub fn can_transition(&self, to: VolumeState) -> bool {
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (VolumeState::Temporary, VolumeState::Uploading)
                | (VolumeState::Temporary, VolumeState::Deleting)
                | (VolumeState::Uploading, VolumeState::Uploaded)
                | (VolumeState::Uploading, VolumeState::Deleting)
                | (VolumeState::Uploaded, VolumeState::Verified)
                | (VolumeState::Uploaded, VolumeState::Deleting)
                | (VolumeState::Verified, VolumeState::Deleting)
                | (VolumeState::Deleting, VolumeState::Deleted)
        )
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `remote_volumes` row.
#[derive(Debug, Clone)]
pub struct RemoteVolumeRow {
    pub id: i64,
    pub operation_id: i64,
    pub name: String,
    pub kind: VolumeKind,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub state: VolumeState,
    pub delete_grace_time: i64,
}

/// Raw column tuple before the kind/state strings are parsed.
type RawVolumeRow = (i64, i64, String, String, Option<i64>, Option<String>, String, i64);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVolumeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_row(raw: RawVolumeRow) -> Result<RemoteVolumeRow> {
    let (id, operation_id, name, kind, size, hash, state, delete_grace_time) = raw;
    Ok(RemoteVolumeRow {
        id,
        operation_id,
        name,
        kind: VolumeKind::from_str(&kind)?,
        size: size.map(|v| v as u64),
        hash,
        state: VolumeState::from_str(&state)?,
        delete_grace_time,
    })
}

const VOLUME_COLUMNS: &str =
    "id, operation_id, name, kind, size, hash, state, delete_grace_time";

/// Insert a new remote volume row. Names are unique across the repository
/// lifetime, so an insert conflict is surfaced as an error.
pub fn register_remote_volume(
    conn: &Connection,
    operation_id: i64,
    name: &str,
    kind: VolumeKind,
    state: VolumeState,
    size: Option<u64>,
    hash: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO remote_volumes(operation_id, name, kind, size, hash, state) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            operation_id,
            name,
            kind.as_str(),
            size.map(|v| v as i64),
            hash,
            state.as_str()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// State-machine enforced update of a remote volume row.
/// `size`/`hash` of `None` leave the stored values untouched.
pub fn update_remote_volume(
    conn: &Connection,
    id: i64,
    new_state: VolumeState,
    size: Option<u64>,
    hash: Option<&str>,
) -> Result<()> {
    let current = remote_volume_by_id(conn, id)?.ok_or_else(|| {
        CairnError::Other(format!("remote volume id {id} not found in catalog"))
    })?;

    if !current.state.can_transition(new_state) {
        return Err(CairnError::IllegalStateTransition {
            name: current.name,
            from: current.state.as_str(),
            to: new_state.as_str(),
        });
    }

    conn.execute(
        "UPDATE remote_volumes SET state = ?1, \
         size = COALESCE(?2, size), hash = COALESCE(?3, hash) WHERE id = ?4",
        params![new_state.as_str(), size.map(|v| v as i64), hash, id],
    )?;
    Ok(())
}

pub fn remote_volume_by_id(conn: &Connection, id: i64) -> Result<Option<RemoteVolumeRow>> {
    let parts = conn
        .query_row(
            &format!("SELECT {VOLUME_COLUMNS} FROM remote_volumes WHERE id = ?1"),
            params![id],
            row_to_raw,
        )
        .optional()?;
    parts.map(finish_row).transpose()
}

pub fn remote_volume_by_name(conn: &Connection, name: &str) -> Result<Option<RemoteVolumeRow>> {
    let parts = conn
        .query_row(
            &format!("SELECT {VOLUME_COLUMNS} FROM remote_volumes WHERE name = ?1"),
            params![name],
            row_to_raw,
        )
        .optional()?;
    parts.map(finish_row).transpose()
}

/// All remote volume rows, oldest id first. Includes `deleted` tombstones.
pub fn remote_volumes(conn: &Connection) -> Result<Vec<RemoteVolumeRow>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {VOLUME_COLUMNS} FROM remote_volumes ORDER BY id"))?;
    let rows = stmt.query_map([], row_to_raw)?;
    let mut volumes = Vec::new();
    for parts in rows {
        volumes.push(finish_row(parts?)?);
    }
    Ok(volumes)
}

/// Record that a dindex volume describes a dblock volume.
pub fn link_index_volume(conn: &Connection, index_volume_id: i64, block_volume_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO index_block_links(index_volume_id, block_volume_id) \
         VALUES (?1, ?2)",
        params![index_volume_id, block_volume_id],
    )?;
    Ok(())
}

/// The dindex volume paired with a dblock volume, if one is recorded.
pub fn index_volume_for(conn: &Connection, block_volume_id: i64) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT index_volume_id FROM index_block_links WHERE block_volume_id = ?1",
            params![block_volume_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Drop the index link rows for a retired dblock volume.
pub fn unlink_block_volume(conn: &Connection, block_volume_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM index_block_links WHERE block_volume_id = ?1",
        params![block_volume_id],
    )?;
    Ok(())
}
