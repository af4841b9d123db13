use std::cmp::Ordering;

use chrono::Utc;
use rusqlite::params;
use tracing::{debug, info};

use crate::catalog::{volumes, Catalog, VolumeState};
use crate::config::CairnConfig;
use crate::crypto::block_id::BlockId;
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};
use crate::progress::{emit, ProgressRange, ProgressSink};
use crate::remote::RemoteQueue;
use crate::volume::index::{write_block_list, IndexBlockEntry};
use crate::volume::{VolumeKind, VolumeManifest, VolumeName, VolumeReader, VolumeWriter};

use super::{begin_remote_session, end_remote_session};

#[derive(Debug, Clone, Copy)]
pub struct CompactOptions {
    /// Rewrite when the referenced fraction is below this percentage.
    pub threshold_percent: f64,
    /// Rewrite when the absolute wasted space exceeds this many bytes.
    pub wasted_space_bytes: u64,
    pub dry_run: bool,
}

impl CompactOptions {
    pub fn from_config(config: &CairnConfig) -> Self {
        Self {
            threshold_percent: config.compact.threshold_percent,
            wasted_space_bytes: config.compact.wasted_space_bytes,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct CompactStats {
    pub volumes_examined: usize,
    pub volumes_rewritten: usize,
    pub volumes_deleted: usize,
    pub blocks_moved: usize,
    pub bytes_reclaimed: u64,
    pub dry_run: bool,
}

/// Waste analysis of one dblock volume.
struct VolumeAnalysis {
    id: i64,
    name: String,
    total_bytes: u64,
    live_bytes: u64,
}

impl VolumeAnalysis {
    fn referenced_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.live_bytes as f64 / self.total_bytes as f64
        }
    }

    fn wasted_bytes(&self) -> u64 {
        self.total_bytes - self.live_bytes
    }
}

/// A live block lifted out of a retired volume, waiting to be repacked.
struct MovedBlock {
    row_id: i64,
    hash: String,
    size: u32,
    data: Vec<u8>,
}

/// A repacked dblock volume ready for registration and upload.
struct NewDblock {
    name: String,
    payload_hash: String,
    payload: Vec<u8>,
    blocks: Vec<(i64, String, u32)>,
}

/// Scan dblock volumes for wasted space, rebuild the survivors, and delete
/// obsolete volumes once the catalog has been updated.
pub fn run(
    config: &CairnConfig,
    catalog: &mut Catalog,
    queue: &mut RemoteQueue,
    crypto: &dyn CryptoEngine,
    opts: CompactOptions,
    mut progress: ProgressSink<'_>,
) -> Result<CompactStats> {
    catalog.check_fit_for_rewrite()?;
    let orphans = catalog.count_orphan_files()?;
    if orphans > 0 {
        return Err(CairnError::OrphanFiles(orphans));
    }

    if opts.dry_run {
        return run_in_range(
            config,
            catalog,
            queue,
            crypto,
            opts,
            ProgressRange::full(),
            &mut progress,
        );
    }

    begin_remote_session(catalog, "compact")?;
    let stats = run_in_range(
        config,
        catalog,
        queue,
        crypto,
        opts,
        ProgressRange::full(),
        &mut progress,
    )?;
    end_remote_session(catalog)?;
    Ok(stats)
}

/// Compact within a progress sub-range. The caller owns the crash flag;
/// purge hands this the trailing quarter of its span.
pub(crate) fn run_in_range(
    config: &CairnConfig,
    catalog: &mut Catalog,
    queue: &mut RemoteQueue,
    crypto: &dyn CryptoEngine,
    opts: CompactOptions,
    range: ProgressRange,
    progress: &mut ProgressSink<'_>,
) -> Result<CompactStats> {
    let mut stats = CompactStats {
        dry_run: opts.dry_run,
        ..Default::default()
    };

    emit(progress, "compact-scan", range.at(0.0));
    let analyses = analyze_volumes(catalog)?;
    stats.volumes_examined = analyses.len();

    let mut dead: Vec<VolumeAnalysis> = Vec::new();
    let mut candidates: Vec<VolumeAnalysis> = Vec::new();
    for analysis in analyses {
        if analysis.live_bytes == 0 {
            dead.push(analysis);
        } else if analysis.referenced_fraction() * 100.0 < opts.threshold_percent
            || analysis.wasted_bytes() >= opts.wasted_space_bytes
        {
            candidates.push(analysis);
        }
    }
    // most wasteful first: ascending referenced fraction, ties by volume id
    candidates.sort_by(|a, b| {
        a.referenced_fraction()
            .partial_cmp(&b.referenced_fraction())
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });

    if opts.dry_run {
        for analysis in &dead {
            info!(name = %analysis.name, "would delete fully unreferenced volume");
            stats.volumes_deleted += 1;
            stats.bytes_reclaimed += analysis.total_bytes;
        }
        for analysis in &candidates {
            info!(
                name = %analysis.name,
                referenced = %format!("{:.1}%", analysis.referenced_fraction() * 100.0),
                "would rewrite volume"
            );
            stats.volumes_rewritten += 1;
            stats.bytes_reclaimed += analysis.wasted_bytes();
        }
        return Ok(stats);
    }

    // volumes with zero references are simply deleted, no rewrite
    if !dead.is_empty() {
        emit(progress, "compact-delete", range.at(0.15));
        let tx = catalog.begin()?;
        let mut to_delete: Vec<(i64, String, Option<u64>)> = Vec::new();
        for analysis in &dead {
            retire_block_volume(&tx, analysis.id, &mut to_delete)?;
            stats.bytes_reclaimed += analysis.total_bytes;
        }
        tx.commit()?;
        for (volume_id, name, size) in to_delete {
            queue.delete(volume_id, &name, size)?;
        }
        queue.flush_pending(catalog)?;
        queue.wait_for_empty(catalog)?;
        stats.volumes_deleted = dead.len();
    }

    if candidates.is_empty() {
        emit(progress, "compact-done", range.at(1.0));
        return Ok(stats);
    }

    // read the referenced blocks out of every candidate
    emit(progress, "compact-read", range.at(0.3));
    let mut moved: Vec<MovedBlock> = Vec::new();
    for analysis in &candidates {
        moved.extend(read_live_blocks(catalog, queue, crypto, analysis)?);
        stats.bytes_reclaimed += analysis.wasted_bytes();
    }
    stats.blocks_moved = moved.len();

    // repack into fresh dblock volumes
    emit(progress, "compact-pack", range.at(0.5));
    let prefix = catalog.prefix()?;
    let blocksize = catalog.blocksize()?;
    let new_volumes = repack_blocks(moved, &prefix, blocksize, config, crypto)?;

    // catalog rewrite: register replacements, remap blocks, retire originals;
    // committed before any upload is enqueued
    emit(progress, "compact-commit", range.at(0.6));
    let operation_id = catalog.begin_operation("compact")?;
    let tx = catalog.begin()?;
    let mut uploads: Vec<(i64, String, Vec<u8>)> = Vec::new();
    let mut deletes: Vec<(i64, String, Option<u64>)> = Vec::new();

    for new_volume in &new_volumes {
        let dblock_id = tx.register_remote_volume(
            operation_id,
            &new_volume.name,
            VolumeKind::Dblock,
            VolumeState::Temporary,
            Some(new_volume.payload.len() as u64),
            Some(&new_volume.payload_hash),
        )?;
        for (row_id, _, _) in &new_volume.blocks {
            tx.conn().execute(
                "UPDATE blocks SET volume_id = ?1 WHERE id = ?2",
                params![dblock_id, row_id],
            )?;
        }

        let index_payload = build_index_volume(new_volume, &prefix, blocksize, config, crypto)?;
        let index_id = tx.register_remote_volume(
            operation_id,
            &index_payload.0,
            VolumeKind::Dindex,
            VolumeState::Temporary,
            Some(index_payload.1.len() as u64),
            Some(&BlockId::compute(&index_payload.1).to_base64()),
        )?;
        volumes::link_index_volume(tx.conn(), index_id, dblock_id)?;

        uploads.push((dblock_id, new_volume.name.clone(), new_volume.payload.clone()));
        uploads.push((index_id, index_payload.0, index_payload.1));
    }

    for analysis in &candidates {
        retire_block_volume(&tx, analysis.id, &mut deletes)?;
    }
    tx.commit()?;

    // uploads strictly before the deletes of the volumes they replace
    emit(progress, "compact-upload", range.at(0.7));
    for (volume_id, name, payload) in uploads {
        queue.put(
            volume_id,
            &name,
            payload,
            Some(Box::new(move |cat: &Catalog| {
                cat.update_remote_volume(volume_id, VolumeState::Uploading, None, None)
            })),
        )?;
    }
    for (volume_id, name, size) in deletes {
        queue.delete(volume_id, &name, size)?;
    }
    queue.flush_pending(catalog)?;
    queue.wait_for_empty(catalog)?;

    stats.volumes_rewritten = candidates.len();
    info!(
        rewritten = stats.volumes_rewritten,
        deleted = stats.volumes_deleted,
        reclaimed = stats.bytes_reclaimed,
        "compact finished"
    );
    emit(progress, "compact-done", range.at(1.0));
    Ok(stats)
}

/// Per-volume live/total byte accounting for every live dblock volume.
fn analyze_volumes(catalog: &Catalog) -> Result<Vec<VolumeAnalysis>> {
    let mut stmt = catalog.conn().prepare(
        "SELECT v.id, v.name, \
            (SELECT COALESCE(SUM(b.size), 0) FROM blocks b WHERE b.volume_id = v.id), \
            (SELECT COALESCE(SUM(b.size), 0) FROM blocks b WHERE b.volume_id = v.id \
               AND EXISTS (SELECT 1 FROM blockset_entries be WHERE be.block_id = b.id)) \
         FROM remote_volumes v \
         WHERE v.kind = 'dblock' AND v.state IN ('uploaded', 'verified') \
         ORDER BY v.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(VolumeAnalysis {
            id: row.get(0)?,
            name: row.get(1)?,
            total_bytes: row.get::<_, i64>(2)? as u64,
            live_bytes: row.get::<_, i64>(3)? as u64,
        })
    })?;
    let mut analyses = Vec::new();
    for row in rows {
        analyses.push(row?);
    }
    Ok(analyses)
}

/// Download a candidate volume and lift its still-referenced blocks out.
fn read_live_blocks(
    catalog: &Catalog,
    queue: &RemoteQueue,
    crypto: &dyn CryptoEngine,
    analysis: &VolumeAnalysis,
) -> Result<Vec<MovedBlock>> {
    let mut stmt = catalog.conn().prepare(
        "SELECT id, hash, size FROM blocks \
         WHERE volume_id = ?1 \
           AND EXISTS (SELECT 1 FROM blockset_entries be WHERE be.block_id = blocks.id)",
    )?;
    let rows = stmt.query_map(params![analysis.id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)? as u32,
        ))
    })?;

    let data = queue.get(&analysis.name)?;
    let reader = VolumeReader::open(&analysis.name, &data, crypto)?;

    let mut blocks = Vec::new();
    for row in rows {
        let (row_id, hash, size) = row?;
        let entry = reader.entry(&hash).ok_or_else(|| {
            CairnError::InvalidFormat(format!(
                "block {hash} missing from volume '{}'",
                analysis.name
            ))
        })?;
        if entry.len() as u32 != size {
            return Err(CairnError::InvalidFormat(format!(
                "block {hash} in volume '{}' has size {} but the catalog records {size}",
                analysis.name,
                entry.len()
            )));
        }
        blocks.push(MovedBlock {
            row_id,
            hash,
            size,
            data: entry.to_vec(),
        });
    }
    debug!(volume = %analysis.name, blocks = blocks.len(), "read live blocks");
    Ok(blocks)
}

/// Pack moved blocks into fresh dblock containers up to the volume size.
fn repack_blocks(
    moved: Vec<MovedBlock>,
    prefix: &str,
    blocksize: u32,
    config: &CairnConfig,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<NewDblock>> {
    let mut finished = Vec::new();
    let mut writer: Option<(VolumeName, VolumeWriter, Vec<(i64, String, u32)>)> = None;

    for block in moved {
        if writer.is_none() {
            let name = VolumeName::generate(
                prefix,
                VolumeKind::Dblock,
                Utc::now(),
                config.compression(),
                crypto.is_encrypting(),
            );
            let manifest = VolumeManifest::new(blocksize, name.compression.ext());
            writer = Some((name, VolumeWriter::new(&manifest)?, Vec::new()));
        }
        let (_, w, blocks) = writer.as_mut().unwrap();
        w.add_entry(block.hash.clone(), block.data);
        blocks.push((block.row_id, block.hash, block.size));

        if w.content_size() >= config.volume_size as u64 {
            finished.push(seal_dblock(writer.take().unwrap(), crypto)?);
        }
    }
    if let Some(open) = writer.take() {
        finished.push(seal_dblock(open, crypto)?);
    }
    Ok(finished)
}

fn seal_dblock(
    (name, writer, blocks): (VolumeName, VolumeWriter, Vec<(i64, String, u32)>),
    crypto: &dyn CryptoEngine,
) -> Result<NewDblock> {
    let name_str = name.to_string();
    let payload = writer.finish(&name, crypto)?;
    Ok(NewDblock {
        name: name_str,
        payload_hash: BlockId::compute(&payload).to_base64(),
        payload,
        blocks,
    })
}

/// Build the dindex volume describing one repacked dblock.
fn build_index_volume(
    dblock: &NewDblock,
    prefix: &str,
    blocksize: u32,
    config: &CairnConfig,
    crypto: &dyn CryptoEngine,
) -> Result<(String, Vec<u8>)> {
    let name = VolumeName::generate(
        prefix,
        VolumeKind::Dindex,
        Utc::now(),
        config.compression(),
        crypto.is_encrypting(),
    );
    let manifest = VolumeManifest::new(blocksize, name.compression.ext());
    let mut writer = VolumeWriter::new(&manifest)?;
    let entries: Vec<IndexBlockEntry> = dblock
        .blocks
        .iter()
        .map(|(_, hash, size)| IndexBlockEntry {
            hash: hash.clone(),
            size: *size,
        })
        .collect();
    write_block_list(&mut writer, &dblock.name, &entries)?;
    let name_str = name.to_string();
    let payload = writer.finish(&name, crypto)?;
    Ok((name_str, payload))
}

/// Move a dblock volume (and its dindex, if any) to `deleting`, drop its
/// dead block rows, and queue the pair for remote removal.
fn retire_block_volume(
    tx: &crate::catalog::CatalogTx<'_>,
    volume_id: i64,
    deletes: &mut Vec<(i64, String, Option<u64>)>,
) -> Result<()> {
    let volume = volumes::remote_volume_by_id(tx.conn(), volume_id)?
        .ok_or_else(|| CairnError::Other(format!("volume {volume_id} missing from catalog")))?;

    tx.conn().execute(
        "DELETE FROM blocks WHERE volume_id = ?1 \
         AND NOT EXISTS (SELECT 1 FROM blockset_entries be WHERE be.block_id = blocks.id)",
        params![volume_id],
    )?;
    tx.update_remote_volume(volume_id, VolumeState::Deleting, None, None)?;
    deletes.push((volume_id, volume.name, volume.size));

    if let Some(index_id) = volumes::index_volume_for(tx.conn(), volume_id)? {
        let index = volumes::remote_volume_by_id(tx.conn(), index_id)?
            .ok_or_else(|| CairnError::Other(format!("dindex {index_id} missing from catalog")))?;
        tx.update_remote_volume(index_id, VolumeState::Deleting, None, None)?;
        deletes.push((index_id, index.name, index.size));
    }
    volumes::unlink_block_volume(tx.conn(), volume_id)?;
    Ok(())
}
