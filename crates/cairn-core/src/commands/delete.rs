use chrono::{DateTime, Utc};
use tracing::info;

use crate::catalog::{Catalog, VolumeState};
use crate::error::{CairnError, Result};
use crate::progress::{emit, ProgressSink};
use crate::remote::RemoteQueue;

use super::{begin_remote_session, end_remote_session};

pub struct DeleteOptions {
    /// Select filesets at or before this instant.
    pub time: Option<DateTime<Utc>>,
    /// Select filesets by version index (0 = newest).
    pub versions: Vec<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct DeleteStats {
    pub filesets_removed: usize,
    pub files_pruned: usize,
    pub volumes_deleted: usize,
    pub dry_run: bool,
}

/// Remove whole filesets. Their dfileset volumes are retired; the data
/// blocks they referenced stay behind until a compact pass reclaims them.
pub fn run(
    catalog: &mut Catalog,
    queue: &mut RemoteQueue,
    opts: DeleteOptions,
    mut progress: ProgressSink<'_>,
) -> Result<DeleteStats> {
    catalog.check_fit_for_rewrite()?;
    let selected = catalog.get_fileset_ids(opts.time, &opts.versions)?;
    if selected.is_empty() {
        return Err(CairnError::NoMatchingVersions);
    }
    if selected.len() == catalog.fileset_times()?.len() {
        return Err(CairnError::Config(
            "refusing to delete every fileset; delete the repository instead".into(),
        ));
    }

    let timestamps: Vec<DateTime<Utc>> = catalog
        .fileset_times()?
        .into_iter()
        .filter(|(id, _)| selected.contains(id))
        .map(|(_, ts)| ts)
        .collect();

    let mut stats = DeleteStats {
        dry_run: opts.dry_run,
        ..Default::default()
    };

    if opts.dry_run {
        for ts in &timestamps {
            info!(timestamp = %ts, "would delete fileset");
        }
        stats.filesets_removed = timestamps.len();
        return Ok(stats);
    }

    begin_remote_session(catalog, "delete")?;
    emit(&mut progress, "delete-filesets", 0.2);

    let tx = catalog.begin()?;
    let orphaned = tx.drop_filesets_from_table(&timestamps)?;
    for (volume_id, _) in &orphaned {
        tx.update_remote_volume(*volume_id, VolumeState::Deleting, None, None)?;
    }
    let (files_pruned, _) = tx.prune_unreferenced()?;
    tx.commit()?;

    emit(&mut progress, "delete-remote", 0.6);
    for (volume_id, name) in &orphaned {
        queue.delete(*volume_id, name, None)?;
    }
    queue.flush_pending(catalog)?;
    queue.wait_for_empty(catalog)?;

    end_remote_session(catalog)?;
    stats.filesets_removed = timestamps.len();
    stats.files_pruned = files_pruned;
    stats.volumes_deleted = orphaned.len();
    info!(
        filesets = stats.filesets_removed,
        files = stats.files_pruned,
        "delete finished"
    );
    emit(&mut progress, "delete-done", 1.0);
    Ok(stats)
}
