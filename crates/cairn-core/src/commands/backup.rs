use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::json;
use tracing::{debug, info};

use crate::catalog::{filesets, volumes, Catalog, CatalogTx, VolumeState};
use crate::catalog::{FOLDER_BLOCKSET_ID, NO_METADATA_ID, SYMLINK_BLOCKSET_ID};
use crate::config::CairnConfig;
use crate::crypto::block_id::BlockId;
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};
use crate::progress::{emit, ProgressSink};
use crate::remote::RemoteQueue;
use crate::volume::index::{write_block_list, write_blocklist_entry, IndexBlockEntry};
use crate::volume::{VolumeKind, VolumeManifest, VolumeName, VolumeWriter};

use super::{begin_remote_session, build_fileset_volume, end_remote_session};

pub struct BackupOptions {
    pub paths: Vec<PathBuf>,
    /// Explicit fileset timestamp (imports and tests). Must be strictly
    /// newer than every existing fileset. Defaults to the wall clock.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct BackupStats {
    pub fileset_id: i64,
    pub files_added: usize,
    pub folders_added: usize,
    pub symlinks_added: usize,
    pub blocks_added: usize,
    pub bytes_stored: u64,
    pub volumes_uploaded: usize,
}

/// Back up the given source trees into a new fileset.
///
/// Fixed-size chunking: every non-terminal block is exactly `blocksize`
/// bytes. All catalog rows are written in one transaction which commits
/// before any upload is enqueued, mirroring the purge discipline.
pub fn run(
    config: &CairnConfig,
    catalog: &mut Catalog,
    queue: &mut RemoteQueue,
    crypto: &dyn CryptoEngine,
    opts: BackupOptions,
    mut progress: ProgressSink<'_>,
) -> Result<BackupStats> {
    if opts.paths.is_empty() {
        return Err(CairnError::Config("no source paths given".into()));
    }
    for path in &opts.paths {
        if !path.exists() {
            return Err(CairnError::Config(format!(
                "source path '{}' does not exist",
                path.display()
            )));
        }
    }

    let operation_id = begin_remote_session(catalog, "backup")?;
    emit(&mut progress, "backup-scan", 0.0);

    let blocksize = catalog.blocksize()?;
    let prefix = catalog.prefix()?;

    // a new fileset must be strictly newer than every existing one
    let newest = catalog.fileset_times()?.first().map(|(_, ts)| *ts);
    let candidate = match (opts.timestamp, newest) {
        (Some(explicit), Some(newest)) if newest >= explicit => {
            return Err(CairnError::Config(format!(
                "fileset timestamp {explicit} is not newer than the latest fileset ({newest})"
            )));
        }
        (Some(explicit), _) => explicit,
        (None, Some(newest)) if newest >= Utc::now() => newest + chrono::Duration::seconds(1),
        (None, _) => Utc::now(),
    };

    let tx = catalog.begin()?;
    let timestamp = filesets::probe_unused_filename(tx.conn(), candidate, None)?;

    let mut ingest = Ingest {
        tx: &tx,
        config,
        crypto,
        operation_id,
        prefix: &prefix,
        blocksize,
        open: None,
        sealed: Vec::new(),
        stats: BackupStats::default(),
    };

    let mut members: Vec<(i64, DateTime<Utc>)> = Vec::new();
    for root in &opts.paths {
        ingest.walk(root, &mut members)?;
    }
    ingest.seal_open_dblock()?;

    // dfileset volume + fileset row
    let fileset_name = VolumeName::generate(
        &prefix,
        VolumeKind::Dfileset,
        timestamp,
        config.compression(),
        crypto.is_encrypting(),
    );
    let fileset_name_str = fileset_name.to_string();
    let fileset_volume_id = tx.register_remote_volume(
        operation_id,
        &fileset_name_str,
        VolumeKind::Dfileset,
        VolumeState::Temporary,
        None,
        None,
    )?;
    let fileset_id =
        filesets::create_fileset(tx.conn(), operation_id, fileset_volume_id, true, timestamp)?;
    for (file_id, mtime) in members {
        filesets::add_fileset_entry(tx.conn(), fileset_id, file_id, mtime)?;
    }

    let payload = build_fileset_volume(
        tx.conn(),
        fileset_id,
        true,
        &fileset_name,
        blocksize,
        crypto,
    )?;
    tx.update_remote_volume(
        fileset_volume_id,
        VolumeState::Temporary,
        Some(payload.len() as u64),
        Some(&BlockId::compute(&payload).to_base64()),
    )?;

    let mut stats = ingest.stats;
    let sealed = ingest.sealed;
    tx.commit()?;

    // commit happened; now the remote side effects
    emit(&mut progress, "backup-upload", 0.6);
    for volume in sealed {
        enqueue_upload(queue, volume.0, volume.1, volume.2)?;
        stats.volumes_uploaded += 1;
    }
    enqueue_upload(queue, fileset_volume_id, fileset_name_str, payload)?;
    stats.volumes_uploaded += 1;
    queue.flush_pending(catalog)?;
    queue.wait_for_empty(catalog)?;

    end_remote_session(catalog)?;
    stats.fileset_id = fileset_id;
    info!(
        fileset_id,
        files = stats.files_added,
        blocks = stats.blocks_added,
        "backup finished"
    );
    emit(&mut progress, "backup-done", 1.0);
    Ok(stats)
}

fn enqueue_upload(
    queue: &mut RemoteQueue,
    volume_id: i64,
    name: String,
    payload: Vec<u8>,
) -> Result<()> {
    queue.put(
        volume_id,
        &name,
        payload,
        Some(Box::new(move |cat: &Catalog| {
            cat.update_remote_volume(volume_id, VolumeState::Uploading, None, None)
        })),
    )
}

/// A dblock container being filled, together with its catalog row.
struct OpenDblock {
    volume_id: i64,
    name: VolumeName,
    writer: VolumeWriter,
    blocks: Vec<IndexBlockEntry>,
    blocklists: Vec<Vec<BlockId>>,
}

/// (volume_id, name, payload) ready for upload after commit.
type SealedVolume = (i64, String, Vec<u8>);

struct Ingest<'a> {
    tx: &'a CatalogTx<'a>,
    config: &'a CairnConfig,
    crypto: &'a dyn CryptoEngine,
    operation_id: i64,
    prefix: &'a str,
    blocksize: u32,
    open: Option<OpenDblock>,
    sealed: Vec<SealedVolume>,
    stats: BackupStats,
}

impl Ingest<'_> {
    fn walk(&mut self, path: &Path, members: &mut Vec<(i64, DateTime<Utc>)>) -> Result<()> {
        let meta = fs::symlink_metadata(path)?;
        let mtime = modified_time(&meta);
        let path_str = normalized_path(path);

        if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            let meta_json =
                json!({ "mtime": mtime.timestamp(), "target": target.to_string_lossy() });
            let metadata_id = self.store_metadata(&meta_json.to_string())?;
            let file_id = filesets::register_file(
                self.tx.conn(),
                &path_str,
                SYMLINK_BLOCKSET_ID,
                metadata_id,
            )?;
            members.push((file_id, mtime));
            self.stats.symlinks_added += 1;
        } else if meta.is_dir() {
            let folder_path = format!("{}/", path_str.trim_end_matches('/'));
            let file_id = filesets::register_file(
                self.tx.conn(),
                &folder_path,
                FOLDER_BLOCKSET_ID,
                NO_METADATA_ID,
            )?;
            members.push((file_id, mtime));
            self.stats.folders_added += 1;

            let mut children: Vec<PathBuf> =
                fs::read_dir(path)?.map(|e| e.map(|e| e.path())).collect::<std::io::Result<_>>()?;
            children.sort();
            for child in children {
                self.walk(&child, members)?;
            }
        } else if meta.is_file() {
            let content = fs::read(path)?;
            let meta_json = json!({ "mtime": mtime.timestamp() });
            let metadata_id = self.store_metadata(&meta_json.to_string())?;
            let blockset_id = self.store_blockset(&content)?;
            let file_id =
                filesets::register_file(self.tx.conn(), &path_str, blockset_id, metadata_id)?;
            members.push((file_id, mtime));
            self.stats.files_added += 1;
        } else {
            debug!(path = %path.display(), "skipping special file");
        }
        Ok(())
    }

    /// Store a metadata stream as a (usually single-block) blockset.
    fn store_metadata(&mut self, metadata: &str) -> Result<i64> {
        self.store_blockset(metadata.as_bytes())
    }

    /// Chunk content at the fixed blocksize, intern blocks, intern the
    /// blockset. Returns the blockset id.
    fn store_blockset(&mut self, content: &[u8]) -> Result<i64> {
        let full_hash = BlockId::compute(content).to_base64();
        let mut block_ids = Vec::new();
        let mut block_hashes = Vec::new();

        let chunks: Vec<&[u8]> = if content.is_empty() {
            vec![&[] as &[u8]]
        } else {
            content.chunks(self.blocksize as usize).collect()
        };
        for chunk in chunks {
            let hash = BlockId::compute(chunk);
            block_hashes.push(hash);
            block_ids.push(self.store_block(hash, chunk)?);
        }

        let (blockset_id, _) = filesets::register_blockset(
            self.tx.conn(),
            content.len() as u64,
            &full_hash,
            &block_ids,
        )?;

        if block_hashes.len() > 1 {
            self.ensure_open_dblock()?;
            self.open.as_mut().unwrap().blocklists.push(block_hashes);
        }
        Ok(blockset_id)
    }

    /// Intern one block, writing its bytes into the open dblock container
    /// when it is new to the repository.
    fn store_block(&mut self, hash: BlockId, data: &[u8]) -> Result<i64> {
        self.ensure_open_dblock()?;
        let open = self.open.as_mut().unwrap();
        let (block_id, was_new) = filesets::register_block(
            self.tx.conn(),
            &hash.to_base64(),
            data.len() as u32,
            open.volume_id,
        )?;
        if was_new {
            open.writer.add_entry(hash.to_base64(), data.to_vec());
            open.blocks.push(IndexBlockEntry {
                hash: hash.to_base64(),
                size: data.len() as u32,
            });
            self.stats.blocks_added += 1;
            self.stats.bytes_stored += data.len() as u64;
            if open.writer.content_size() >= self.config.volume_size as u64 {
                self.seal_open_dblock()?;
            }
        }
        Ok(block_id)
    }

    fn ensure_open_dblock(&mut self) -> Result<()> {
        if self.open.is_some() {
            return Ok(());
        }
        let name = VolumeName::generate(
            self.prefix,
            VolumeKind::Dblock,
            Utc::now(),
            self.config.compression(),
            self.crypto.is_encrypting(),
        );
        let volume_id = self.tx.register_remote_volume(
            self.operation_id,
            &name.to_string(),
            VolumeKind::Dblock,
            VolumeState::Temporary,
            None,
            None,
        )?;
        self.open = Some(OpenDblock {
            volume_id,
            name,
            writer: VolumeWriter::new(&VolumeManifest::new(
                self.blocksize,
                self.config.compression().ext(),
            ))?,
            blocks: Vec::new(),
            blocklists: Vec::new(),
        });
        Ok(())
    }

    /// Finish the open dblock container, update its catalog row, and build
    /// the matching dindex volume.
    fn seal_open_dblock(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        if open.blocks.is_empty() {
            // everything deduplicated; discard the unused row
            self.tx.conn().execute(
                "DELETE FROM remote_volumes WHERE id = ?1",
                params![open.volume_id],
            )?;
            return Ok(());
        }

        let name_str = open.name.to_string();
        let payload = open.writer.finish(&open.name, self.crypto)?;
        self.tx.update_remote_volume(
            open.volume_id,
            VolumeState::Temporary,
            Some(payload.len() as u64),
            Some(&BlockId::compute(&payload).to_base64()),
        )?;
        self.sealed.push((open.volume_id, name_str.clone(), payload));

        // matching dindex
        let index_name = VolumeName::generate(
            self.prefix,
            VolumeKind::Dindex,
            Utc::now(),
            self.config.compression(),
            self.crypto.is_encrypting(),
        );
        let mut index_writer = VolumeWriter::new(&VolumeManifest::new(
            self.blocksize,
            self.config.compression().ext(),
        ))?;
        write_block_list(&mut index_writer, &name_str, &open.blocks)?;
        for blocklist in &open.blocklists {
            write_blocklist_entry(&mut index_writer, blocklist);
        }
        let index_name_str = index_name.to_string();
        let index_payload = index_writer.finish(&index_name, self.crypto)?;
        let index_id = self.tx.register_remote_volume(
            self.operation_id,
            &index_name_str,
            VolumeKind::Dindex,
            VolumeState::Temporary,
            Some(index_payload.len() as u64),
            Some(&BlockId::compute(&index_payload).to_base64()),
        )?;
        volumes::link_index_volume(self.tx.conn(), index_id, open.volume_id)?;
        self.sealed.push((index_id, index_name_str, index_payload));
        Ok(())
    }
}

fn normalized_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn modified_time(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .ok()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now)
}
