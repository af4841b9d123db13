use chrono::{Duration, TimeZone, Utc};

use crate::catalog::{filesets, volumes, Catalog, VolumeState};
use crate::error::CairnError;
use crate::volume::VolumeKind;

fn test_catalog() -> Catalog {
    Catalog::open_in_memory(1024, "cairn").unwrap()
}

fn ts(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Register a dfileset volume and a fileset bound to it.
fn add_fileset(catalog: &Catalog, op: i64, secs: i64) -> (i64, i64) {
    let name = format!("cairn-{:06x}-f-20250101T{:06}Z.zst", secs, secs % 240_000);
    let volume_id = volumes::register_remote_volume(
        catalog.conn(),
        op,
        &name,
        VolumeKind::Dfileset,
        VolumeState::Uploaded,
        Some(100),
        Some("hash"),
    )
    .unwrap();
    let fileset_id =
        filesets::create_fileset(catalog.conn(), op, volume_id, true, ts(secs)).unwrap();
    (fileset_id, volume_id)
}

#[test]
fn settings_roundtrip() {
    let catalog = test_catalog();
    assert_eq!(catalog.blocksize().unwrap(), 1024);
    assert_eq!(catalog.prefix().unwrap(), "cairn");
    assert!(!catalog.flag("terminated_with_active_uploads").unwrap());
    catalog.set_flag("terminated_with_active_uploads", true).unwrap();
    assert!(catalog.flag("terminated_with_active_uploads").unwrap());
}

#[test]
fn open_missing_catalog_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.sqlite");
    match Catalog::open(&path) {
        Err(CairnError::CatalogNotFound(_)) => {}
        other => panic!("expected CatalogNotFound, got {other:?}"),
    }
}

#[test]
fn create_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.sqlite");
    {
        let catalog = Catalog::create(&path, 4096, "pfx").unwrap();
        catalog.set_setting("probe", "value").unwrap();
    }
    let catalog = Catalog::open(&path).unwrap();
    assert_eq!(catalog.blocksize().unwrap(), 4096);
    assert_eq!(catalog.setting("probe").unwrap().as_deref(), Some("value"));
}

#[test]
fn state_machine_enforced() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    let id = volumes::register_remote_volume(
        catalog.conn(),
        op,
        "cairn-aabbcc-b-20250101T120000Z.zst",
        VolumeKind::Dblock,
        VolumeState::Temporary,
        None,
        None,
    )
    .unwrap();

    // forward path
    catalog.update_remote_volume(id, VolumeState::Uploading, None, None).unwrap();
    catalog
        .update_remote_volume(id, VolumeState::Uploaded, Some(10), Some("h"))
        .unwrap();
    catalog.update_remote_volume(id, VolumeState::Verified, None, None).unwrap();

    // backward is rejected with a diagnostic
    match catalog.update_remote_volume(id, VolumeState::Uploading, None, None) {
        Err(CairnError::IllegalStateTransition { from, to, .. }) => {
            assert_eq!(from, "verified");
            assert_eq!(to, "uploading");
        }
        other => panic!("expected IllegalStateTransition, got {other:?}"),
    }

    // retire edge still works, and deleted is terminal
    catalog.update_remote_volume(id, VolumeState::Deleting, None, None).unwrap();
    catalog.update_remote_volume(id, VolumeState::Deleted, None, None).unwrap();
    assert!(catalog
        .update_remote_volume(id, VolumeState::Uploading, None, None)
        .is_err());
}

#[test]
fn duplicate_volume_name_rejected() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    let name = "cairn-aabbcc-b-20250101T120000Z.zst";
    volumes::register_remote_volume(
        catalog.conn(),
        op,
        name,
        VolumeKind::Dblock,
        VolumeState::Temporary,
        None,
        None,
    )
    .unwrap();
    assert!(volumes::register_remote_volume(
        catalog.conn(),
        op,
        name,
        VolumeKind::Dblock,
        VolumeState::Temporary,
        None,
        None,
    )
    .is_err());
}

#[test]
fn block_interning_is_unique() {
    let catalog = test_catalog();
    let (a, new_a) = filesets::register_block(catalog.conn(), "hashA", 64, 1).unwrap();
    let (b, new_b) = filesets::register_block(catalog.conn(), "hashA", 64, 2).unwrap();
    assert_eq!(a, b);
    assert!(new_a);
    assert!(!new_b);
}

#[test]
fn fileset_times_newest_first() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    add_fileset(&catalog, op, 100);
    add_fileset(&catalog, op, 300);
    add_fileset(&catalog, op, 200);

    let times = catalog.fileset_times().unwrap();
    let secs: Vec<i64> = times.iter().map(|(_, t)| t.timestamp()).collect();
    assert_eq!(secs, vec![300, 200, 100]);
}

#[test]
fn get_fileset_ids_by_version_and_time() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    let (id_old, _) = add_fileset(&catalog, op, 100);
    let (id_mid, _) = add_fileset(&catalog, op, 200);
    let (id_new, _) = add_fileset(&catalog, op, 300);

    // version 0 is the newest
    assert_eq!(catalog.get_fileset_ids(None, &[0]).unwrap(), vec![id_new]);
    assert_eq!(catalog.get_fileset_ids(None, &[2]).unwrap(), vec![id_old]);
    // out-of-range indices resolve to nothing
    assert!(catalog.get_fileset_ids(None, &[7]).unwrap().is_empty());
    // a time bound selects everything at or before it, newest first
    assert_eq!(
        catalog.get_fileset_ids(Some(ts(250)), &[]).unwrap(),
        vec![id_mid, id_old]
    );
    // no selection at all means every fileset
    assert_eq!(
        catalog.get_fileset_ids(None, &[]).unwrap(),
        vec![id_new, id_mid, id_old]
    );
}

#[test]
fn probe_skips_taken_seconds() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    add_fileset(&catalog, op, 100);
    add_fileset(&catalog, op, 101);

    // both 100 and 101 are taken; with no upper bound the probe lands on 102
    let probed = filesets::probe_unused_filename(catalog.conn(), ts(100), None).unwrap();
    assert_eq!(probed.timestamp(), 102);

    // with the next fileset at 101, there is no free second in [100, 101)
    match filesets::probe_unused_filename(catalog.conn(), ts(100), Some(ts(101))) {
        Err(CairnError::TimestampCollision { candidate, limit }) => {
            assert_eq!(candidate, 100);
            assert_eq!(limit, 101);
        }
        other => panic!("expected TimestampCollision, got {other:?}"),
    }
}

#[test]
fn probe_considers_remote_dfileset_names() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    // a live dfileset blob at 20250101T120001Z with no fileset row
    volumes::register_remote_volume(
        catalog.conn(),
        op,
        "cairn-aabbcc-f-20250101T120001Z.zst",
        VolumeKind::Dfileset,
        VolumeState::Uploaded,
        Some(1),
        None,
    )
    .unwrap();
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 1).unwrap();
    let probed = filesets::probe_unused_filename(catalog.conn(), t0, None).unwrap();
    assert_eq!(probed, t0 + Duration::seconds(1));
}

#[test]
fn orphan_counting_and_pruning() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    let (fileset_id, _) = add_fileset(&catalog, op, 100);

    let (bs, _) = filesets::register_blockset(catalog.conn(), 3, "full", &[]).unwrap();
    let kept = filesets::register_file(catalog.conn(), "/kept", bs, 0).unwrap();
    let orphan = filesets::register_file(catalog.conn(), "/orphan", bs, 0).unwrap();
    filesets::add_fileset_entry(catalog.conn(), fileset_id, kept, ts(50)).unwrap();

    assert_eq!(catalog.count_orphan_files().unwrap(), 1);
    let (files, blocksets) = filesets::prune_unreferenced(catalog.conn()).unwrap();
    assert_eq!(files, 1);
    assert_eq!(blocksets, 0); // still referenced by /kept
    assert_eq!(catalog.count_orphan_files().unwrap(), 0);
    assert_ne!(kept, orphan);
}

#[test]
fn consistency_flags_monotonicity_violation() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    add_fileset(&catalog, op, 200);
    add_fileset(&catalog, op, 100); // larger id, older timestamp

    let issues = catalog.verify_consistency(false).unwrap();
    assert!(
        issues.iter().any(|i| i.contains("monotonicity")),
        "issues: {issues:?}"
    );
    assert!(catalog.verify_consistency(true).is_err());
}

#[test]
fn consistency_flags_dangling_references() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    let (fileset_id, _) = add_fileset(&catalog, op, 100);
    // entry pointing at a file that does not exist
    catalog
        .conn()
        .execute(
            "INSERT INTO fileset_entries(fileset_id, file_id, last_modified) VALUES (?1, 999, 0)",
            [fileset_id],
        )
        .unwrap();
    let issues = catalog.verify_consistency(false).unwrap();
    assert!(
        issues.iter().any(|i| i.contains("missing file")),
        "issues: {issues:?}"
    );
}

#[test]
fn consistency_clean_on_fresh_catalog() {
    let catalog = test_catalog();
    assert!(catalog.verify_consistency(true).unwrap().is_empty());
}

#[test]
fn drop_filesets_returns_orphaned_volumes() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    let (_, vol_a) = add_fileset(&catalog, op, 100);
    add_fileset(&catalog, op, 200);

    let orphaned = filesets::drop_filesets_from_table(catalog.conn(), &[ts(100)]).unwrap();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].0, vol_a);
    assert_eq!(catalog.fileset_times().unwrap().len(), 1);
}

#[test]
fn convert_to_permanent_keeps_id_order() {
    let catalog = test_catalog();
    let op = catalog.begin_operation("test").unwrap();
    let (fs_old, vol_old) = add_fileset(&catalog, op, 100);
    add_fileset(&catalog, op, 200);

    let temp = filesets::create_temporary_fileset(catalog.conn(), op, fs_old).unwrap();
    let new_vol = volumes::register_remote_volume(
        catalog.conn(),
        op,
        "cairn-ddeeff-f-20250101T120000Z.zst",
        VolumeKind::Dfileset,
        VolumeState::Temporary,
        None,
        None,
    )
    .unwrap();
    let replaced_vol =
        filesets::convert_to_permanent_fileset(catalog.conn(), temp, fs_old, new_vol, ts(101))
            .unwrap();
    assert_eq!(replaced_vol, vol_old);

    // retire the replaced volume as purge would, then the catalog is clean:
    // the rewritten fileset kept the original id, so id order still matches
    // timestamp order
    catalog
        .update_remote_volume(vol_old, VolumeState::Deleting, None, None)
        .unwrap();
    assert!(catalog.verify_consistency(false).unwrap().is_empty());

    let times = catalog.fileset_times().unwrap();
    let rewritten = times.iter().find(|(id, _)| *id == fs_old).unwrap();
    assert_eq!(rewritten.1.timestamp(), 101);
}
