use chrono::{TimeZone, Utc};

use crate::compress::Compression;
use crate::crypto::aes_gcm::Aes256GcmEngine;
use crate::crypto::PlaintextEngine;
use crate::volume::fileset::{
    read_fileset_entries, write_fileset_entries, FileKind, FileRecord, FilesetMeta,
};
use crate::volume::index::{read_block_lists, write_block_list, IndexBlockEntry};
use crate::volume::{VolumeKind, VolumeManifest, VolumeName, VolumeReader, VolumeWriter};

fn test_name(compression: Compression, encrypted: bool) -> VolumeName {
    VolumeName::generate(
        "cairn",
        VolumeKind::Dblock,
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
        compression,
        encrypted,
    )
}

#[test]
fn container_roundtrip_plaintext() {
    let crypto = PlaintextEngine;
    for compression in [
        Compression::None,
        Compression::Lz4,
        Compression::Zstd { level: 3 },
    ] {
        let name = test_name(compression, false);
        let manifest = VolumeManifest::new(1024, compression.ext());
        let mut writer = VolumeWriter::new(&manifest).unwrap();
        writer.add_entry("alpha", b"first entry".to_vec());
        writer.add_entry("beta", vec![0u8; 2048]);
        writer.add_entry("empty", Vec::new());
        let blob = writer.finish(&name, &crypto).unwrap();

        let reader = VolumeReader::open(&name.to_string(), &blob, &crypto).unwrap();
        assert_eq!(reader.entry("alpha").unwrap(), b"first entry");
        assert_eq!(reader.entry("beta").unwrap(), &[0u8; 2048][..]);
        assert_eq!(reader.entry("empty").unwrap(), b"");
        assert!(reader.entry("missing").is_none());

        let parsed = reader.manifest().unwrap();
        assert_eq!(parsed.blocksize, 1024);
        assert_eq!(parsed.encoding, compression.ext());
        assert_eq!(parsed.block_hash, "blake2b-256");
    }
}

#[test]
fn container_roundtrip_encrypted() {
    let crypto = Aes256GcmEngine::new(&[9u8; 32]);
    let name = test_name(Compression::Zstd { level: 3 }, true);
    let manifest = VolumeManifest::new(1024, "zst");
    let mut writer = VolumeWriter::new(&manifest).unwrap();
    writer.add_entry("data", b"secret payload".to_vec());
    let blob = writer.finish(&name, &crypto).unwrap();

    let reader = VolumeReader::open(&name.to_string(), &blob, &crypto).unwrap();
    assert_eq!(reader.entry("data").unwrap(), b"secret payload");
}

#[test]
fn container_bound_to_its_name() {
    // the filename is authenticated data: the same bytes under another name
    // must not decrypt
    let crypto = Aes256GcmEngine::new(&[9u8; 32]);
    let name = test_name(Compression::None, true);
    let manifest = VolumeManifest::new(1024, "raw");
    let mut writer = VolumeWriter::new(&manifest).unwrap();
    writer.add_entry("data", b"payload".to_vec());
    let blob = writer.finish(&name, &crypto).unwrap();

    let mut other = name.clone();
    other.random = if other.random == "abcdef" {
        "fedcba".into()
    } else {
        "abcdef".into()
    };
    assert!(VolumeReader::open(&other.to_string(), &blob, &crypto).is_err());
}

#[test]
fn container_rejects_corruption() {
    let crypto = PlaintextEngine;
    let name = test_name(Compression::None, false);
    let manifest = VolumeManifest::new(1024, "raw");
    let mut writer = VolumeWriter::new(&manifest).unwrap();
    writer.add_entry("data", b"payload".to_vec());
    let mut blob = writer.finish(&name, &crypto).unwrap();

    // clobber the magic
    blob[0] ^= 0xFF;
    assert!(VolumeReader::open(&name.to_string(), &blob, &crypto).is_err());
}

#[test]
fn fileset_entries_roundtrip() {
    let crypto = PlaintextEngine;
    let name = VolumeName::generate(
        "cairn",
        VolumeKind::Dfileset,
        Utc::now(),
        Compression::Lz4,
        false,
    );
    let manifest = VolumeManifest::new(1024, "lz4");
    let mut writer = VolumeWriter::new(&manifest).unwrap();
    let records = vec![
        FileRecord {
            path: "/data/a.txt".into(),
            kind: FileKind::File,
            size: 42,
            hash: Some("abc".into()),
            metahash: Some("def".into()),
            time: 1_700_000_000,
        },
        FileRecord {
            path: "/data/".into(),
            kind: FileKind::Folder,
            size: 0,
            hash: None,
            metahash: None,
            time: 1_700_000_001,
        },
    ];
    write_fileset_entries(
        &mut writer,
        &FilesetMeta {
            is_full_backup: true,
        },
        &records,
    )
    .unwrap();
    let blob = writer.finish(&name, &crypto).unwrap();

    let reader = VolumeReader::open(&name.to_string(), &blob, &crypto).unwrap();
    let (meta, parsed) = read_fileset_entries(&reader).unwrap();
    assert!(meta.is_full_backup);
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].path, "/data/a.txt");
    assert_eq!(parsed[0].kind, FileKind::File);
    assert_eq!(parsed[1].kind, FileKind::Folder);
}

#[test]
fn index_block_lists_roundtrip() {
    let crypto = PlaintextEngine;
    let name = VolumeName::generate(
        "cairn",
        VolumeKind::Dindex,
        Utc::now(),
        Compression::None,
        false,
    );
    let manifest = VolumeManifest::new(1024, "raw");
    let mut writer = VolumeWriter::new(&manifest).unwrap();
    let blocks = vec![
        IndexBlockEntry {
            hash: "aaaa".into(),
            size: 1024,
        },
        IndexBlockEntry {
            hash: "bbbb".into(),
            size: 17,
        },
    ];
    write_block_list(&mut writer, "cairn-aabbcc-b-20250101T000000Z.raw", &blocks).unwrap();
    let blob = writer.finish(&name, &crypto).unwrap();

    let reader = VolumeReader::open(&name.to_string(), &blob, &crypto).unwrap();
    let lists = read_block_lists(&reader).unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].0, "cairn-aabbcc-b-20250101T000000Z.raw");
    assert_eq!(lists[0].1, blocks);
}
