use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use rusqlite::params;
use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogTx, VolumeState};
use crate::config::CairnConfig;
use crate::crypto::block_id::BlockId;
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};
use crate::progress::{emit, ProgressRange, ProgressSink};
use crate::remote::RemoteQueue;
use crate::volume::{VolumeKind, VolumeName};

use super::{begin_remote_session, build_fileset_volume, compact, end_remote_session, verify};

/// What to remove from the selected filesets: a glob over paths, or an
/// opaque SQL predicate over the catalog's `files` table (aliased `f`).
pub enum PurgeFilter {
    PathGlob(GlobSet),
    CatalogSelector(String),
}

impl PurgeFilter {
    /// Build a path filter from glob patterns. Empty patterns are dropped;
    /// an effectively empty filter is rejected outright, since it would
    /// erase every file.
    pub fn paths<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut any = false;
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            any = true;
            builder.add(
                GlobBuilder::new(pattern)
                    .literal_separator(false)
                    .build()
                    .map_err(|e| CairnError::Config(format!("bad filter '{pattern}': {e}")))?,
            );
        }
        if !any {
            return Err(CairnError::EmptyFilter);
        }
        Ok(PurgeFilter::PathGlob(builder.build().map_err(|e| {
            CairnError::Config(format!("bad filter set: {e}"))
        })?))
    }

    /// Use a catalog-side SQL predicate.
    pub fn selector(predicate: &str) -> Result<Self> {
        if predicate.trim().is_empty() {
            return Err(CairnError::EmptyFilter);
        }
        Ok(PurgeFilter::CatalogSelector(predicate.to_string()))
    }
}

pub struct PurgeOptions {
    pub filter: PurgeFilter,
    /// Select filesets at or before this instant.
    pub time: Option<DateTime<Utc>>,
    /// Select filesets by version index (0 = newest).
    pub versions: Vec<usize>,
    pub dry_run: bool,
    pub no_auto_compact: bool,
    pub no_backend_verification: bool,
}

#[derive(Debug, Default)]
pub struct PurgeStats {
    pub filesets_examined: usize,
    pub filesets_rewritten: usize,
    pub files_removed: usize,
    pub files_updated: usize,
    pub volumes_uploaded: usize,
    pub volumes_deleted: usize,
    pub dry_run: bool,
    /// Dry-run only: paths that would have been removed.
    pub would_purge: Vec<String>,
    /// Dry-run only: (upload, delete) volume name pairs that were skipped.
    pub would_upload_and_delete: Vec<(String, String)>,
    pub compact: Option<compact::CompactStats>,
}

/// Everything a committed rewrite needs for its remote side effects.
/// Carried across the transaction boundary so no transaction stays open
/// over a network write.
struct RewriteOutcome {
    new_volume_id: i64,
    new_name: String,
    payload: Vec<u8>,
    old_volume_id: i64,
    old_name: String,
    old_size: Option<u64>,
    removed_paths: Vec<String>,
}

/// Rewrite the selected filesets so that files matching the filter are no
/// longer part of them, replacing each manifest atomically with respect to
/// the catalog and with crash-safe remote side effects.
pub fn run(
    config: &CairnConfig,
    catalog: &mut Catalog,
    queue: &mut RemoteQueue,
    crypto: &dyn CryptoEngine,
    opts: PurgeOptions,
    mut progress: ProgressSink<'_>,
) -> Result<PurgeStats> {
    // preconditions: fail fast, before any transaction or side effect
    catalog.check_fit_for_rewrite()?;
    let orphans = catalog.count_orphan_files()?;
    if orphans > 0 {
        return Err(CairnError::OrphanFiles(orphans));
    }
    let selected = catalog.get_fileset_ids(opts.time, &opts.versions)?;
    if selected.is_empty() {
        return Err(CairnError::NoMatchingVersions);
    }
    if !opts.no_backend_verification {
        if let Some(issue) = verify::verify_remote(catalog, queue)?.into_iter().next() {
            return Err(issue.into_error());
        }
    }

    let operation_id = if opts.dry_run {
        catalog.begin_operation("purge (dry-run)")?
    } else {
        begin_remote_session(catalog, "purge")?
    };

    // oldest first, so rewriting never pushes a timestamp past a newer
    // version that is itself about to be rewritten
    let times = catalog.fileset_times()?;
    let mut ordered: Vec<(i64, DateTime<Utc>)> = times
        .into_iter()
        .filter(|(id, _)| selected.contains(id))
        .collect();
    ordered.sort_by_key(|(_, ts)| *ts);

    let may_compact = !opts.no_auto_compact && !opts.dry_run;
    let purge_range = if may_compact {
        ProgressRange::full().slice(0.0, 0.75)
    } else {
        ProgressRange::full()
    };

    let mut stats = PurgeStats {
        dry_run: opts.dry_run,
        ..Default::default()
    };

    let total = ordered.len();
    for (index, (fileset_id, _)) in ordered.into_iter().enumerate() {
        let version_range = purge_range.slice(
            index as f64 / total as f64,
            (index + 1) as f64 / total as f64,
        );
        emit(&mut progress, "purge-fileset", version_range.at(0.0));
        stats.filesets_examined += 1;

        let blocksize = catalog.blocksize()?;
        let prefix = catalog.prefix()?;
        let tx = catalog.begin()?;
        // any error here drops the transaction, which rolls it back
        let outcome = rewrite_fileset(
            &tx,
            operation_id,
            fileset_id,
            &opts.filter,
            &prefix,
            blocksize,
            config,
            crypto,
        )?;

        let Some(outcome) = outcome else {
            debug!(fileset_id, "no files matched, leaving fileset untouched");
            tx.rollback()?;
            emit(&mut progress, "purge-fileset", version_range.at(1.0));
            continue;
        };

        stats.files_removed += outcome.removed_paths.len();

        if opts.dry_run {
            for path in &outcome.removed_paths {
                info!(path = %path, "WouldPurgeFile");
            }
            info!(
                upload = %outcome.new_name,
                delete = %outcome.old_name,
                "WouldUploadAndDelete"
            );
            stats.would_purge.extend(outcome.removed_paths);
            stats
                .would_upload_and_delete
                .push((outcome.new_name, outcome.old_name));
            stats.filesets_rewritten += 1;
            tx.rollback()?;
            emit(&mut progress, "purge-fileset", version_range.at(1.0));
            continue;
        }

        // commit before the upload: after this point the catalog records the
        // intended truth, and a crash is reconciled by the next run's verifier
        tx.commit()?;

        emit(&mut progress, "purge-upload", version_range.at(0.7));
        let new_volume_id = outcome.new_volume_id;
        queue.put(
            new_volume_id,
            &outcome.new_name,
            outcome.payload,
            Some(Box::new(move |cat: &Catalog| {
                cat.update_remote_volume(new_volume_id, VolumeState::Uploading, None, None)
            })),
        )?;
        queue.delete(outcome.old_volume_id, &outcome.old_name, outcome.old_size)?;
        queue.flush_pending(catalog)?;
        queue.wait_for_empty(catalog)?;

        stats.filesets_rewritten += 1;
        stats.volumes_uploaded += 1;
        stats.volumes_deleted += 1;
        info!(
            fileset_id,
            removed = stats.files_removed,
            new_volume = %outcome.new_name,
            "fileset rewritten"
        );
        emit(&mut progress, "purge-fileset", version_range.at(1.0));
    }

    if may_compact && stats.filesets_rewritten > 0 {
        let compact_range = ProgressRange::full().slice(0.75, 1.0);
        let compact_stats = compact::run_in_range(
            config,
            catalog,
            queue,
            crypto,
            compact::CompactOptions::from_config(config),
            compact_range,
            &mut progress,
        )?;
        stats.compact = Some(compact_stats);
    }

    queue.wait_for_empty(catalog)?;
    if !opts.dry_run {
        end_remote_session(catalog)?;
    }
    emit(&mut progress, "purge-done", 1.0);
    Ok(stats)
}

/// Per-fileset rewrite inside one open catalog transaction.
///
/// Returns `None` when the filter matched nothing (the caller rolls back).
/// On `Some`, the transaction holds: the filtered fileset under the original
/// id with the probed timestamp, the new dfileset volume registered as
/// `temporary`, the old volume moved to `deleting`, and no orphan rows.
#[allow(clippy::too_many_arguments)]
fn rewrite_fileset(
    tx: &CatalogTx<'_>,
    operation_id: i64,
    fileset_id: i64,
    filter: &PurgeFilter,
    prefix: &str,
    blocksize: u32,
    config: &CairnConfig,
    crypto: &dyn CryptoEngine,
) -> Result<Option<RewriteOutcome>> {
    let (t_original, is_full): (i64, bool) = tx.conn().query_row(
        "SELECT timestamp, is_full_backup FROM filesets WHERE id = ?1",
        params![fileset_id],
        |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
    )?;
    let t_original = DateTime::from_timestamp(t_original, 0)
        .ok_or_else(|| CairnError::Other(format!("timestamp {t_original} out of range")))?;

    let t_next: Option<i64> = tx.conn().query_row(
        "SELECT MIN(timestamp) FROM filesets WHERE timestamp > ?1",
        params![t_original.timestamp()],
        |row| row.get(0),
    )?;
    let t_next = match t_next {
        Some(ts) => Some(
            DateTime::from_timestamp(ts, 0)
                .ok_or_else(|| CairnError::Other(format!("timestamp {ts} out of range")))?,
        ),
        None => None,
    };

    let t_new = tx.probe_unused_filename(t_original, t_next)?;

    let temp_id = tx.create_temporary_fileset(operation_id, fileset_id)?;

    let removed: Vec<String> = match filter {
        PurgeFilter::PathGlob(glob) => {
            let entries = tx.list_fileset_entries(temp_id)?;
            let matched: Vec<(i64, String)> = entries
                .into_iter()
                .filter(|(_, path)| glob.is_match(path))
                .collect();
            let ids: Vec<i64> = matched.iter().map(|(id, _)| *id).collect();
            tx.remove_fileset_entries(temp_id, &ids)?;
            matched.into_iter().map(|(_, path)| path).collect()
        }
        PurgeFilter::CatalogSelector(predicate) => {
            let sql = format!(
                "SELECT f.id, f.path FROM fileset_entries fe \
                 JOIN files f ON f.id = fe.file_id \
                 WHERE fe.fileset_id = ?1 AND ({predicate})"
            );
            let mut stmt = tx.conn().prepare(&sql)?;
            let rows = stmt.query_map(params![temp_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut matched: Vec<(i64, String)> = Vec::new();
            for row in rows {
                matched.push(row?);
            }
            let ids: Vec<i64> = matched.iter().map(|(id, _)| *id).collect();
            tx.remove_fileset_entries(temp_id, &ids)?;
            matched.into_iter().map(|(_, path)| path).collect()
        }
    };

    if removed.is_empty() {
        return Ok(None);
    }

    let name = VolumeName::generate(
        prefix,
        VolumeKind::Dfileset,
        t_new,
        config.compression(),
        crypto.is_encrypting(),
    );
    let name_str = name.to_string();
    let payload = build_fileset_volume(tx.conn(), temp_id, is_full, &name, blocksize, crypto)?;
    let payload_hash = BlockId::compute(&payload).to_base64();

    let new_volume_id = tx.register_remote_volume(
        operation_id,
        &name_str,
        VolumeKind::Dfileset,
        VolumeState::Temporary,
        Some(payload.len() as u64),
        Some(&payload_hash),
    )?;

    let old_volume_id =
        tx.convert_to_permanent_fileset(temp_id, fileset_id, new_volume_id, t_new)?;

    let old_volume = crate::catalog::volumes::remote_volume_by_id(tx.conn(), old_volume_id)?
        .ok_or_else(|| {
            CairnError::Other(format!("dfileset volume {old_volume_id} missing from catalog"))
        })?;
    tx.update_remote_volume(old_volume_id, VolumeState::Deleting, None, None)?;

    // drop file and blockset rows only the old manifest referenced; the
    // blocks they leave behind are compact's business
    tx.prune_unreferenced()?;

    Ok(Some(RewriteOutcome {
        new_volume_id,
        new_name: name_str,
        payload,
        old_volume_id,
        old_name: old_volume.name,
        old_size: old_volume.size,
        removed_paths: removed,
    }))
}
