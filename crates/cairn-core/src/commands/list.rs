use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::catalog::Catalog;
use crate::error::Result;

/// One fileset as shown by `cairn list`.
#[derive(Debug, Clone)]
pub struct FilesetInfo {
    /// Version index, 0 = newest.
    pub version: usize,
    pub fileset_id: i64,
    pub timestamp: DateTime<Utc>,
    pub is_full_backup: bool,
    pub file_count: i64,
    pub volume_name: String,
}

/// Enumerate filesets, newest first.
pub fn run(catalog: &Catalog) -> Result<Vec<FilesetInfo>> {
    let times = catalog.fileset_times()?;
    let mut infos = Vec::with_capacity(times.len());
    for (version, (fileset_id, timestamp)) in times.into_iter().enumerate() {
        let (is_full_backup, file_count, volume_name) = catalog.conn().query_row(
            "SELECT fs.is_full_backup, \
                (SELECT COUNT(*) FROM fileset_entries fe WHERE fe.fileset_id = fs.id), \
                rv.name \
             FROM filesets fs JOIN remote_volumes rv ON rv.id = fs.volume_id \
             WHERE fs.id = ?1",
            params![fileset_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? != 0,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;
        infos.push(FilesetInfo {
            version,
            fileset_id,
            timestamp,
            is_full_backup,
            file_count,
            volume_name,
        });
    }
    Ok(infos)
}
