pub mod consistency;
pub mod filesets;
pub mod schema;
pub mod volumes;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::{CairnError, Result};
use crate::volume::VolumeKind;

pub use schema::{FOLDER_BLOCKSET_ID, NO_METADATA_ID, SYMLINK_BLOCKSET_ID};
pub use volumes::{RemoteVolumeRow, VolumeState};

/// Settings key of the crash flag: set `true` before any session performing
/// remote writes and cleared on clean completion. A `true` value on open
/// tells the verifier to reconcile partial uploads.
pub const TERMINATED_WITH_ACTIVE_UPLOADS: &str = "terminated_with_active_uploads";
/// Settings key marking a catalog that is being rebuilt from remote state.
pub const PARTIAL_RECREATE: &str = "partial_recreate";
/// Settings key marking a catalog with an unfinished repair.
pub const REPAIR_IN_PROGRESS: &str = "repair_in_progress";

/// The local catalog: a transactional relational store of blocks, blocksets,
/// files, filesets, and remote volume state.
///
/// The connection is exclusive per process; all access happens from the
/// orchestrating thread.
#[derive(Debug)]
pub struct Catalog {
    conn: Connection,
    path: PathBuf,
}

impl Catalog {
    /// Create a new catalog file, failing if one already exists.
    pub fn create(path: &Path, blocksize: u32, prefix: &str) -> Result<Self> {
        if path.exists() {
            return Err(CairnError::Config(format!(
                "catalog already exists at '{}'",
                path.display()
            )));
        }
        let conn = Self::open_connection(path)?;
        schema::init_schema(&conn)?;
        schema::write_initial_settings(&conn, blocksize, prefix)?;
        debug!(path = %path.display(), "created catalog");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing catalog file.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CairnError::CatalogNotFound(path.display().to_string()));
        }
        let conn = Self::open_connection(path)?;
        schema::check_schema_version(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open the catalog at `path`, creating it when missing.
    pub fn open_or_create(path: &Path, blocksize: u32, prefix: &str) -> Result<Self> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, blocksize, prefix)
        }
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory(blocksize: u32, prefix: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init_schema(&conn)?;
        schema::write_initial_settings(&conn, blocksize, prefix)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        // exclusive locking mode keeps the catalog single-writer per process
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw connection access for module-level query helpers.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin an immediate transaction.
    pub fn begin(&mut self) -> Result<CatalogTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(CatalogTx { tx })
    }

    // ----- settings -----

    pub fn setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn flag(&self, key: &str) -> Result<bool> {
        Ok(self.setting(key)?.as_deref() == Some("true"))
    }

    pub fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.set_setting(key, if value { "true" } else { "false" })
    }

    /// The block size this catalog was created with.
    pub fn blocksize(&self) -> Result<u32> {
        self.setting("blocksize")?
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CairnError::CatalogState("missing blocksize setting".into()))
    }

    /// The remote filename prefix this catalog was created with.
    pub fn prefix(&self) -> Result<String> {
        self.setting("prefix")?
            .ok_or_else(|| CairnError::CatalogState("missing prefix setting".into()))
    }

    /// Reject purge/compact on catalogs that are mid-recreate or mid-repair.
    pub fn check_fit_for_rewrite(&self) -> Result<()> {
        if self.flag(PARTIAL_RECREATE)? {
            return Err(CairnError::CatalogState("partially recreated".into()));
        }
        if self.flag(REPAIR_IN_PROGRESS)? {
            return Err(CairnError::CatalogState("mid-repair".into()));
        }
        Ok(())
    }

    // ----- operations log -----

    pub fn begin_operation(&self, description: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO operations(description, timestamp) VALUES (?1, ?2)",
            params![description, Utc::now().timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ----- read-only queries (outside any transaction) -----

    pub fn fileset_times(&self) -> Result<Vec<(i64, DateTime<Utc>)>> {
        filesets::fileset_times(&self.conn)
    }

    pub fn get_fileset_ids(
        &self,
        time: Option<DateTime<Utc>>,
        versions: &[usize],
    ) -> Result<Vec<i64>> {
        filesets::get_fileset_ids(&self.conn, time, versions)
    }

    pub fn count_orphan_files(&self) -> Result<i64> {
        filesets::count_orphan_files(&self.conn)
    }

    pub fn remote_volumes(&self) -> Result<Vec<RemoteVolumeRow>> {
        volumes::remote_volumes(&self.conn)
    }

    pub fn remote_volume_by_id(&self, id: i64) -> Result<Option<RemoteVolumeRow>> {
        volumes::remote_volume_by_id(&self.conn, id)
    }

    pub fn remote_volume_by_name(&self, name: &str) -> Result<Option<RemoteVolumeRow>> {
        volumes::remote_volume_by_name(&self.conn, name)
    }

    /// Non-transactional state update, used by the queue's completion path
    /// where each transition is a single-statement commit.
    pub fn update_remote_volume(
        &self,
        id: i64,
        new_state: VolumeState,
        size: Option<u64>,
        hash: Option<&str>,
    ) -> Result<()> {
        volumes::update_remote_volume(&self.conn, id, new_state, size, hash)
    }

    pub fn verify_consistency(&self, strict: bool) -> Result<Vec<String>> {
        let blocksize = self.blocksize()?;
        consistency::verify_consistency(
            &self.conn,
            blocksize,
            crate::crypto::block_id::BLOCK_HASH_SIZE,
            strict,
        )
    }
}

/// An open immediate transaction over the catalog.
///
/// All purge/compact mutations happen through one of these; the transaction
/// is always closed (committed or rolled back) before any remote side effect
/// is enqueued.
pub struct CatalogTx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl CatalogTx<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }

    /// Raw connection access for module-level query helpers.
    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }

    pub fn create_temporary_fileset(&self, operation_id: i64, source_fileset_id: i64) -> Result<i64> {
        filesets::create_temporary_fileset(&self.tx, operation_id, source_fileset_id)
    }

    pub fn list_fileset_entries(&self, fileset_id: i64) -> Result<Vec<(i64, String)>> {
        filesets::list_fileset_entries(&self.tx, fileset_id)
    }

    pub fn remove_fileset_entries(&self, fileset_id: i64, file_ids: &[i64]) -> Result<usize> {
        filesets::remove_fileset_entries(&self.tx, fileset_id, file_ids)
    }

    pub fn convert_to_permanent_fileset(
        &self,
        temp_fileset_id: i64,
        original_fileset_id: i64,
        new_volume_id: i64,
        new_timestamp: DateTime<Utc>,
    ) -> Result<i64> {
        filesets::convert_to_permanent_fileset(
            &self.tx,
            temp_fileset_id,
            original_fileset_id,
            new_volume_id,
            new_timestamp,
        )
    }

    pub fn drop_filesets_from_table(
        &self,
        timestamps: &[DateTime<Utc>],
    ) -> Result<Vec<(i64, String)>> {
        filesets::drop_filesets_from_table(&self.tx, timestamps)
    }

    pub fn prune_unreferenced(&self) -> Result<(usize, usize)> {
        filesets::prune_unreferenced(&self.tx)
    }

    pub fn probe_unused_filename(
        &self,
        t_original: DateTime<Utc>,
        t_next: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        filesets::probe_unused_filename(&self.tx, t_original, t_next)
    }

    pub fn register_remote_volume(
        &self,
        operation_id: i64,
        name: &str,
        kind: VolumeKind,
        state: VolumeState,
        size: Option<u64>,
        hash: Option<&str>,
    ) -> Result<i64> {
        volumes::register_remote_volume(&self.tx, operation_id, name, kind, state, size, hash)
    }

    pub fn update_remote_volume(
        &self,
        id: i64,
        new_state: VolumeState,
        size: Option<u64>,
        hash: Option<&str>,
    ) -> Result<()> {
        volumes::update_remote_volume(&self.tx, id, new_state, size, hash)
    }

    pub fn fileset_file_records(
        &self,
        fileset_id: i64,
    ) -> Result<Vec<crate::volume::fileset::FileRecord>> {
        filesets::fileset_file_records(&self.tx, fileset_id)
    }
}
