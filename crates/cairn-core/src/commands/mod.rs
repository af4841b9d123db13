pub mod backup;
pub mod compact;
pub mod delete;
pub mod list;
pub mod purge;
pub mod verify;

use std::sync::Arc;

use rusqlite::Connection;

use crate::catalog::{filesets, Catalog, TERMINATED_WITH_ACTIVE_UPLOADS};
use crate::config::{CairnConfig, EncryptionMode};
use crate::crypto::{aes_gcm::Aes256GcmEngine, derive_key, CryptoEngine, PlaintextEngine};
use crate::error::{CairnError, Result};
use crate::volume::fileset::{write_fileset_entries, FilesetMeta};
use crate::volume::{VolumeManifest, VolumeName, VolumeWriter};

/// Build the crypto engine selected by the configuration.
pub fn engine_from_config(config: &CairnConfig) -> Result<Arc<dyn CryptoEngine>> {
    match config.encryption.mode {
        EncryptionMode::None => Ok(Arc::new(PlaintextEngine)),
        EncryptionMode::Aes256Gcm => {
            let passphrase = config.encryption.passphrase.as_deref().ok_or_else(|| {
                CairnError::Config("encryption enabled but no passphrase given".into())
            })?;
            Ok(Arc::new(Aes256GcmEngine::new(&derive_key(passphrase))))
        }
    }
}

/// Mark the start of a session that performs remote writes and log the
/// operation. The flag stays set until `end_remote_session`, so a crash
/// leaves it up for the next run's verifier.
pub(crate) fn begin_remote_session(catalog: &Catalog, description: &str) -> Result<i64> {
    catalog.set_flag(TERMINATED_WITH_ACTIVE_UPLOADS, true)?;
    catalog.begin_operation(description)
}

pub(crate) fn end_remote_session(catalog: &Catalog) -> Result<()> {
    catalog.set_flag(TERMINATED_WITH_ACTIVE_UPLOADS, false)
}

/// Serialize a fileset into a finished dfileset container.
///
/// Used by purge when writing a rewritten fileset and by repair when
/// re-materializing a missing dfileset blob from catalog rows.
pub(crate) fn build_fileset_volume(
    conn: &Connection,
    fileset_id: i64,
    is_full_backup: bool,
    name: &VolumeName,
    blocksize: u32,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let records = filesets::fileset_file_records(conn, fileset_id)?;
    let manifest = VolumeManifest::new(blocksize, name.compression.ext());
    let mut writer = VolumeWriter::new(&manifest)?;
    write_fileset_entries(
        &mut writer,
        &FilesetMeta {
            is_full_backup,
        },
        &records,
    )?;
    writer.finish(name, crypto)
}
