use crate::catalog::VolumeState;
use crate::commands::verify::{self, VerifyOptions};
use crate::storage::StorageBackend;
use crate::testutil::{TestRepo, TEST_BLOCKSIZE};
use crate::volume::{VolumeKind, VolumeName};

#[test]
fn backup_creates_consistent_fileset() {
    let mut repo = TestRepo::new();
    let stats = repo.backup_tree(&[("a.txt", b"hello"), ("b.txt", b"world")]);

    assert_eq!(stats.files_added, 2);
    assert!(stats.folders_added >= 1);
    assert!(stats.blocks_added > 0);
    // dblock + dindex + dfileset at minimum
    assert!(stats.volumes_uploaded >= 3);

    assert!(repo.catalog.verify_consistency(true).unwrap().is_empty());
    assert_eq!(repo.catalog.count_orphan_files().unwrap(), 0);
    assert!(!repo.catalog.flag("terminated_with_active_uploads").unwrap());

    // every volume ends the session uploaded
    for volume in repo.catalog.remote_volumes().unwrap() {
        assert_eq!(volume.state, VolumeState::Uploaded, "{}", volume.name);
        assert!(repo.backend.exists(&volume.name).unwrap(), "{}", volume.name);
    }
}

#[test]
fn backup_chunks_large_files_at_blocksize() {
    let mut repo = TestRepo::new();
    let content = vec![7u8; TEST_BLOCKSIZE as usize * 3 + 10];
    repo.backup_tree(&[("big.bin", &content)]);

    // 3 full blocks + 1 short terminal block for the content
    let blocks: i64 = repo
        .catalog
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM blockset_entries be \
             JOIN blocksets bs ON bs.id = be.blockset_id WHERE bs.length = ?1",
            [content.len() as i64],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(blocks, 4);
    assert!(repo.catalog.verify_consistency(true).unwrap().is_empty());
}

#[test]
fn second_backup_deduplicates_blocks() {
    let mut repo = TestRepo::new();
    let first = repo.backup_tree(&[("a.txt", b"same content")]);
    let second = repo.backup_tree(&[("a.txt", b"same content")]);

    assert!(first.blocks_added > 0);
    assert_eq!(second.blocks_added, 0);
    // nothing new to store: only the dfileset volume goes out
    assert_eq!(second.volumes_uploaded, 1);

    let times = repo.catalog.fileset_times().unwrap();
    assert_eq!(times.len(), 2);
    // strictly monotonic timestamps
    assert!(times[0].1 > times[1].1);
}

#[test]
fn backup_passes_strict_verify() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"payload-a"), ("nested/b.txt", b"payload-b")]);

    let report = verify::run(
        &mut repo.catalog,
        &mut repo.queue,
        repo.crypto.as_ref(),
        VerifyOptions {
            strict: true,
            repair: false,
        },
        None,
    )
    .unwrap();
    assert!(report.is_clean());

    // strict verification promotes uploaded volumes to verified
    for volume in repo.catalog.remote_volumes().unwrap() {
        assert_eq!(volume.state, VolumeState::Verified, "{}", volume.name);
    }
}

#[test]
fn dfileset_name_encodes_fileset_timestamp() {
    let mut repo = TestRepo::new();
    repo.backup_tree(&[("a.txt", b"x")]);

    let (_, fileset_ts) = repo.catalog.fileset_times().unwrap()[0];
    let dfileset = repo
        .catalog
        .remote_volumes()
        .unwrap()
        .into_iter()
        .find(|v| v.kind == VolumeKind::Dfileset)
        .unwrap();
    let parsed = VolumeName::parse(&dfileset.name).unwrap();
    assert_eq!(parsed.timestamp, fileset_ts);
    assert_eq!(parsed.kind, VolumeKind::Dfileset);
    assert_eq!(parsed.prefix, "cairn");
}
