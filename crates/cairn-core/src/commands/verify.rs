use std::collections::HashMap;

use tracing::{info, warn};

use crate::catalog::{filesets, Catalog, VolumeState, TERMINATED_WITH_ACTIVE_UPLOADS};
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};
use crate::progress::{emit, ProgressSink};
use crate::remote::RemoteQueue;
use crate::volume::{VolumeKind, VolumeName};

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Treat any remote discrepancy as fatal.
    pub strict: bool,
    /// Reconcile: finish pending deletes, re-upload missing dfilesets,
    /// clean up partial uploads from a crashed session.
    pub repair: bool,
}

/// A single local-vs-remote discrepancy.
#[derive(Debug, Clone)]
pub enum VerifyIssue {
    /// Blob on the backend that the catalog knows nothing about.
    ExtraFile { name: String },
    /// Catalog requires this blob but the backend does not have it.
    MissingFile { name: String },
    /// Blob present with the wrong size.
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    /// Row left in temporary/uploading by an interrupted session.
    StaleUpload { name: String },
}

impl VerifyIssue {
    pub fn into_error(self) -> CairnError {
        match self {
            VerifyIssue::ExtraFile { name } => CairnError::ExtraRemoteFile(name),
            VerifyIssue::MissingFile { name } => CairnError::MissingRemoteFile(name),
            VerifyIssue::SizeMismatch {
                name,
                expected,
                actual,
            } => CairnError::RemoteSizeMismatch {
                name,
                expected,
                actual,
            },
            VerifyIssue::StaleUpload { name } => CairnError::CatalogState(format!(
                "interrupted upload of '{name}'; run verify with repair"
            )),
        }
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Catalog-internal invariant violations.
    pub catalog_issues: Vec<String>,
    /// Local-vs-remote discrepancies.
    pub remote_issues: Vec<VerifyIssue>,
    /// Blobs re-uploaded or promoted during repair.
    pub repaired: usize,
    /// Blobs and rows cleaned up during repair.
    pub cleaned: usize,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.catalog_issues.is_empty() && self.remote_issues.is_empty()
    }
}

/// Compare the catalog's remote-volume rows against the backend listing.
///
/// Pure classification: no catalog or backend mutation. Rows in `deleting`
/// tolerate absence; rows in `uploaded`/`verified` require presence with a
/// matching size; rows in `temporary`/`uploading` are stale uploads left by
/// a crash.
pub fn verify_remote(catalog: &Catalog, queue: &RemoteQueue) -> Result<Vec<VerifyIssue>> {
    let mut listed: HashMap<String, u64> = HashMap::new();
    for name in queue.list()? {
        let size = queue.backend().size(&name)?.unwrap_or(0);
        listed.insert(name, size);
    }
    classify(catalog, &listed)
}

fn classify(catalog: &Catalog, listed: &HashMap<String, u64>) -> Result<Vec<VerifyIssue>> {
    let mut issues = Vec::new();
    let prefix = catalog.prefix()?;

    for volume in catalog.remote_volumes()? {
        match volume.state {
            VolumeState::Uploaded | VolumeState::Verified => match listed.get(&volume.name) {
                None => issues.push(VerifyIssue::MissingFile {
                    name: volume.name.clone(),
                }),
                Some(&actual) => {
                    if let Some(expected) = volume.size {
                        if actual != expected {
                            issues.push(VerifyIssue::SizeMismatch {
                                name: volume.name.clone(),
                                expected,
                                actual,
                            });
                        }
                    }
                }
            },
            VolumeState::Temporary | VolumeState::Uploading => {
                issues.push(VerifyIssue::StaleUpload {
                    name: volume.name.clone(),
                });
            }
            // a deleting row is a tombstone: absence is fine, presence means
            // the remote delete has not happened yet
            VolumeState::Deleting | VolumeState::Deleted => {}
        }
    }

    for name in listed.keys() {
        if catalog.remote_volume_by_name(name)?.is_some() {
            continue;
        }
        // tolerate foreign blobs only if they don't carry our prefix
        match VolumeName::parse(name) {
            Ok(parsed) if parsed.prefix == prefix => {
                issues.push(VerifyIssue::ExtraFile { name: name.clone() })
            }
            Ok(_) => {}
            Err(_) => issues.push(VerifyIssue::ExtraFile { name: name.clone() }),
        }
    }

    Ok(issues)
}

/// Run the consistency verifier: catalog invariants, then the remote
/// comparison, then (optionally) reconciliation.
pub fn run(
    catalog: &mut Catalog,
    queue: &mut RemoteQueue,
    crypto: &dyn CryptoEngine,
    opts: VerifyOptions,
    mut progress: ProgressSink<'_>,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    emit(&mut progress, "verify-catalog", 0.0);
    report.catalog_issues = catalog.verify_consistency(false)?;

    emit(&mut progress, "verify-remote", 0.3);
    let mut listed: HashMap<String, u64> = HashMap::new();
    for name in queue.list()? {
        let size = queue.backend().size(&name)?.unwrap_or(0);
        listed.insert(name, size);
    }
    report.remote_issues = classify(catalog, &listed)?;

    if opts.repair {
        emit(&mut progress, "verify-repair", 0.6);
        repair(catalog, queue, crypto, &listed, &mut report)?;
        // re-classify after reconciliation
        let mut listed: HashMap<String, u64> = HashMap::new();
        for name in queue.list()? {
            let size = queue.backend().size(&name)?.unwrap_or(0);
            listed.insert(name, size);
        }
        report.remote_issues = classify(catalog, &listed)?;
    }

    if report.is_clean() {
        // strict confirmation of presence and size is what earns the
        // uploaded -> verified promotion
        if opts.strict {
            for volume in catalog.remote_volumes()? {
                if volume.state == VolumeState::Uploaded {
                    catalog.update_remote_volume(volume.id, VolumeState::Verified, None, None)?;
                }
            }
        }
        if catalog.flag(TERMINATED_WITH_ACTIVE_UPLOADS)? && opts.repair {
            catalog.set_flag(TERMINATED_WITH_ACTIVE_UPLOADS, false)?;
        }
    } else if opts.strict {
        let first = report.remote_issues.first().cloned();
        if let Some(issue) = first {
            return Err(issue.into_error());
        }
        return Err(CairnError::CatalogState(format!(
            "consistency check failed: {}",
            report.catalog_issues[0]
        )));
    }

    emit(&mut progress, "verify-done", 1.0);
    Ok(report)
}

/// Reconcile catalog and backend after an interrupted session.
fn repair(
    catalog: &mut Catalog,
    queue: &mut RemoteQueue,
    crypto: &dyn CryptoEngine,
    listed: &HashMap<String, u64>,
    report: &mut VerifyReport,
) -> Result<()> {
    let volumes = catalog.remote_volumes()?;
    let prefix = catalog.prefix()?;
    let blocksize = catalog.blocksize()?;

    for volume in &volumes {
        match volume.state {
            // finish interrupted retires
            VolumeState::Deleting => {
                if listed.contains_key(&volume.name) {
                    queue.delete(volume.id, &volume.name, volume.size)?;
                } else {
                    catalog.update_remote_volume(volume.id, VolumeState::Deleted, None, None)?;
                }
                report.cleaned += 1;
            }
            // reconcile interrupted uploads
            VolumeState::Temporary | VolumeState::Uploading => {
                let present = listed.get(&volume.name);
                let size_matches = match (present, volume.size) {
                    (Some(&actual), Some(expected)) => actual == expected,
                    (Some(_), None) => true,
                    (None, _) => false,
                };

                if size_matches {
                    // the blob landed; the session died before the ack
                    if volume.state == VolumeState::Temporary {
                        catalog.update_remote_volume(
                            volume.id,
                            VolumeState::Uploading,
                            None,
                            None,
                        )?;
                    }
                    catalog.update_remote_volume(volume.id, VolumeState::Uploaded, None, None)?;
                    report.repaired += 1;
                    continue;
                }

                let referenced = filesets::fileset_by_volume(catalog.conn(), volume.id)?;
                if volume.kind == VolumeKind::Dfileset && referenced.is_some() {
                    // the catalog is the intended truth: re-materialize the
                    // manifest and upload it under its recorded name (the
                    // put overwrites any partial blob)
                    info!(name = %volume.name, "re-uploading dfileset from catalog");
                    let (fileset_id, _, is_full) = referenced.expect("checked above");
                    let parsed = VolumeName::parse(&volume.name)?;
                    let payload = super::build_fileset_volume(
                        catalog.conn(),
                        fileset_id,
                        is_full,
                        &parsed,
                        blocksize,
                        crypto,
                    )?;
                    let volume_id = volume.id;
                    let needs_promote = volume.state == VolumeState::Temporary;
                    queue.put(
                        volume.id,
                        &volume.name,
                        payload,
                        Some(Box::new(move |cat: &Catalog| {
                            if needs_promote {
                                cat.update_remote_volume(
                                    volume_id,
                                    VolumeState::Uploading,
                                    None,
                                    None,
                                )?;
                            }
                            Ok(())
                        })),
                    )?;
                    report.repaired += 1;
                } else {
                    // a partial upload nothing references: delete the blob if
                    // any landed and tombstone the row
                    warn!(name = %volume.name, "dropping partial upload from interrupted session");
                    catalog.update_remote_volume(volume.id, VolumeState::Deleting, None, None)?;
                    if present.is_some() {
                        queue.delete(volume.id, &volume.name, None)?;
                    } else {
                        catalog.update_remote_volume(volume.id, VolumeState::Deleted, None, None)?;
                    }
                    report.cleaned += 1;
                }
            }
            _ => {}
        }
    }

    // extra blobs carrying our prefix are deleted; foreign blobs are left alone
    for name in listed.keys() {
        if catalog.remote_volume_by_name(name)?.is_some() {
            continue;
        }
        if let Ok(parsed) = VolumeName::parse(name) {
            if parsed.prefix == prefix {
                warn!(name = %name, "deleting unknown blob with repository prefix");
                queue.backend().delete(name)?;
                report.cleaned += 1;
            }
        }
    }

    queue.wait_for_empty(catalog)?;
    Ok(())
}
