use std::sync::Arc;

use crate::catalog::{VolumeState, TERMINATED_WITH_ACTIVE_UPLOADS};
use crate::commands::purge::{self, PurgeFilter, PurgeOptions};
use crate::commands::verify::{self, VerifyIssue, VerifyOptions};
use crate::error::CairnError;
use crate::remote::RemoteQueue;
use crate::storage::StorageBackend;
use crate::testutil::{FailingBackend, MemoryBackend, TestRepo};
use crate::volume::fileset::read_fileset_entries;
use crate::volume::{VolumeKind, VolumeReader};

fn purge_opts() -> PurgeOptions {
    PurgeOptions {
        filter: PurgeFilter::paths(&["*a.txt"]).unwrap(),
        time: None,
        versions: vec![0],
        dry_run: false,
        no_auto_compact: true,
        no_backend_verification: false,
    }
}

#[test]
fn clean_repo_verifies_clean() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"hello")]);

    let issues = verify::verify_remote(&repo.catalog, &repo.queue).unwrap();
    assert!(issues.is_empty(), "{issues:?}");
}

#[test]
fn missing_blob_is_classified() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"hello")]);

    // lose a dblock volume behind the catalog's back
    let victim = repo
        .catalog
        .remote_volumes()
        .unwrap()
        .into_iter()
        .find(|v| v.kind == VolumeKind::Dblock)
        .unwrap();
    repo.backend.delete(&victim.name).unwrap();

    let issues = verify::verify_remote(&repo.catalog, &repo.queue).unwrap();
    assert_eq!(issues.len(), 1);
    match &issues[0] {
        VerifyIssue::MissingFile { name } => assert_eq!(name, &victim.name),
        other => panic!("expected MissingFile, got {other:?}"),
    }

    // purge's backend verification precondition turns this fatal
    let err = purge::run(
        &repo.config.clone(),
        &mut repo.catalog,
        &mut repo.queue,
        repo.crypto.as_ref(),
        purge_opts(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::MissingRemoteFile(_)), "{err}");
}

#[test]
fn size_mismatch_is_classified() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"hello")]);

    let victim = repo
        .catalog
        .remote_volumes()
        .unwrap()
        .into_iter()
        .find(|v| v.kind == VolumeKind::Dfileset)
        .unwrap();
    repo.backend.put(&victim.name, b"truncated").unwrap();

    let issues = verify::verify_remote(&repo.catalog, &repo.queue).unwrap();
    assert!(
        issues
            .iter()
            .any(|i| matches!(i, VerifyIssue::SizeMismatch { name, .. } if name == &victim.name)),
        "{issues:?}"
    );
}

#[test]
fn foreign_blob_with_our_prefix_is_extra() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"hello")]);

    repo.backend
        .put("cairn-facade-b-20300101T000000Z.zst", b"not ours")
        .unwrap();
    // a blob with an alien prefix is tolerated
    repo.backend
        .put("other-aabbcc-b-20300101T000000Z.zst", b"different tool")
        .unwrap();
    // unparseable names are flagged
    repo.backend.put("README.txt", b"stray").unwrap();

    let issues = verify::verify_remote(&repo.catalog, &repo.queue).unwrap();
    let extras: Vec<&str> = issues
        .iter()
        .filter_map(|i| match i {
            VerifyIssue::ExtraFile { name } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert!(extras.contains(&"cairn-facade-b-20300101T000000Z.zst"));
    assert!(extras.contains(&"README.txt"));
    assert!(!extras.contains(&"other-aabbcc-b-20300101T000000Z.zst"));
}

/// Crash between catalog commit and upload of the replacement dfileset:
/// the next run's verifier finds the catalog ahead of the backend and a
/// repair restores the blob from catalog rows.
#[test]
fn crash_between_commit_and_upload_is_repaired() {
    let inner = Arc::new(MemoryBackend::new());
    let failing = Arc::new(FailingBackend::new(inner.clone(), 0, false));
    let mut repo = TestRepo::with_storage(inner.clone(), failing.clone());

    repo.backup_tree(&[("a.txt", b"doomed"), ("b.txt", b"survives")]);
    repo.backup_tree(&[("a.txt", b"doomed"), ("b.txt", b"survives")]);

    // the purge commits, then the dfileset upload dies
    failing.set_failures(usize::MAX);
    let err = purge::run(
        &repo.config.clone(),
        &mut repo.catalog,
        &mut repo.queue,
        repo.crypto.as_ref(),
        purge_opts(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::BackendPermanent(_)), "{err}");

    // catalog already records the intended truth
    assert!(repo.catalog.flag(TERMINATED_WITH_ACTIVE_UPLOADS).unwrap());
    let volumes = repo.catalog.remote_volumes().unwrap();
    let stale = volumes
        .iter()
        .find(|v| v.state == VolumeState::Uploading && v.kind == VolumeKind::Dfileset)
        .expect("replacement dfileset stuck in uploading");
    let tombstone = volumes
        .iter()
        .find(|v| v.state == VolumeState::Deleting && v.kind == VolumeKind::Dfileset)
        .expect("old dfileset stuck in deleting");
    assert!(!inner.exists(&stale.name).unwrap());
    assert!(inner.exists(&tombstone.name).unwrap());

    // "next invocation": healthy backend, fresh queue, verify with repair
    failing.set_failures(0);
    repo.queue = RemoteQueue::new(failing.clone(), repo.config.retry.clone());

    let issues = verify::verify_remote(&repo.catalog, &repo.queue).unwrap();
    assert!(
        issues
            .iter()
            .any(|i| matches!(i, VerifyIssue::StaleUpload { name } if name == &stale.name)),
        "{issues:?}"
    );

    let report = verify::run(
        &mut repo.catalog,
        &mut repo.queue,
        repo.crypto.as_ref(),
        VerifyOptions {
            strict: false,
            repair: true,
        },
        None,
    )
    .unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(report.repaired >= 1);

    // remote state now matches the catalog: replacement present, old gone
    assert!(inner.exists(&stale.name).unwrap());
    assert!(!inner.exists(&tombstone.name).unwrap());
    assert!(!repo.catalog.flag(TERMINATED_WITH_ACTIVE_UPLOADS).unwrap());
    assert!(repo.catalog.verify_consistency(true).unwrap().is_empty());

    // the re-materialized manifest matches the catalog's membership: the
    // purged file is absent, the survivor is present
    let data = inner.get(&stale.name).unwrap().unwrap();
    let reader = VolumeReader::open(&stale.name, &data, repo.crypto.as_ref()).unwrap();
    let (_, records) = read_fileset_entries(&reader).unwrap();
    assert!(records.iter().all(|r| !r.path.ends_with("a.txt")));
    assert!(records.iter().any(|r| r.path.ends_with("b.txt")));
}

#[test]
fn repair_finishes_pending_delete() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"hello")]);

    // simulate a crash mid-retire: row says deleting, blob still there
    let victim = repo
        .catalog
        .remote_volumes()
        .unwrap()
        .into_iter()
        .find(|v| v.kind == VolumeKind::Dindex)
        .unwrap();
    repo.catalog
        .update_remote_volume(victim.id, VolumeState::Deleting, None, None)
        .unwrap();

    let report = verify::run(
        &mut repo.catalog,
        &mut repo.queue,
        repo.crypto.as_ref(),
        VerifyOptions {
            strict: false,
            repair: true,
        },
        None,
    )
    .unwrap();
    assert!(report.cleaned >= 1);
    assert!(!repo.backend.exists(&victim.name).unwrap());
    let row = repo.catalog.remote_volume_by_id(victim.id).unwrap().unwrap();
    assert_eq!(row.state, VolumeState::Deleted);
}

#[test]
fn repair_removes_extra_blob_with_our_prefix() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"hello")]);
    repo.backend
        .put("cairn-0ddba1-b-20300101T000000Z.zst", b"leftover")
        .unwrap();

    let report = verify::run(
        &mut repo.catalog,
        &mut repo.queue,
        repo.crypto.as_ref(),
        VerifyOptions {
            strict: false,
            repair: true,
        },
        None,
    )
    .unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(!repo
        .backend
        .exists("cairn-0ddba1-b-20300101T000000Z.zst")
        .unwrap());
}

#[test]
fn strict_verify_fails_on_discrepancy() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"hello")]);
    let victim = repo.catalog.remote_volumes().unwrap()[0].name.clone();
    repo.backend.delete(&victim).unwrap();

    let err = verify::run(
        &mut repo.catalog,
        &mut repo.queue,
        repo.crypto.as_ref(),
        VerifyOptions {
            strict: true,
            repair: false,
        },
        None,
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::MissingRemoteFile(_)), "{err}");
}
