//! End-to-end lifecycle over a local directory backend: backup, list,
//! purge, compact, verify.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use cairn_core::catalog::Catalog;
use cairn_core::commands::{self, backup, compact, list, purge, verify};
use cairn_core::config::{
    CairnConfig, CompactConfig, CompressionConfig, EncryptionConfig, EncryptionMode,
    RepositoryConfig, RetryConfig,
};
use cairn_core::remote::RemoteQueue;
use cairn_core::storage::{backend_from_url, StorageBackend};

struct Harness {
    config: CairnConfig,
    catalog: Catalog,
    queue: RemoteQueue,
    backend: Arc<dyn StorageBackend>,
    crypto: Arc<dyn cairn_core::crypto::CryptoEngine>,
    src: PathBuf,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    snapshot_clock: i64,
}

impl Harness {
    fn new(encrypted: bool) -> Self {
        let repo_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let src = work_dir.path().join("source");
        fs::create_dir_all(&src).unwrap();

        let config = CairnConfig {
            repository: RepositoryConfig {
                url: repo_dir.path().to_string_lossy().into_owned(),
            },
            catalog: work_dir
                .path()
                .join("catalog.sqlite")
                .to_string_lossy()
                .into_owned(),
            encryption: EncryptionConfig {
                mode: if encrypted {
                    EncryptionMode::Aes256Gcm
                } else {
                    EncryptionMode::None
                },
                passphrase: encrypted.then(|| "integration secret".to_string()),
            },
            compression: CompressionConfig::default(),
            blocksize: 64,
            volume_size: 4096,
            prefix: "cairn".into(),
            compact: CompactConfig {
                threshold_percent: 50.0,
                wasted_space_bytes: u64::MAX,
            },
            retry: RetryConfig {
                max_retries: 1,
                retry_delay_ms: 1,
                retry_max_delay_ms: 2,
            },
        };
        config.validate().unwrap();

        let backend: Arc<dyn StorageBackend> =
            Arc::from(backend_from_url(&config.repository.url).unwrap());
        let catalog = Catalog::create(
            std::path::Path::new(&config.catalog),
            config.blocksize,
            &config.prefix,
        )
        .unwrap();
        let queue = RemoteQueue::new(Arc::clone(&backend), config.retry.clone());
        let crypto = commands::engine_from_config(&config).unwrap();

        Self {
            config,
            catalog,
            queue,
            backend,
            crypto,
            src,
            _dirs: (repo_dir, work_dir),
            snapshot_clock: Utc
                .with_ymd_and_hms(2025, 3, 1, 0, 0, 0)
                .unwrap()
                .timestamp(),
        }
    }

    fn write_source(&self, rel: &str, content: &[u8]) {
        let path = self.src.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn backup(&mut self) -> backup::BackupStats {
        let timestamp = chrono::DateTime::from_timestamp(self.snapshot_clock, 0).unwrap();
        self.snapshot_clock += 600;
        backup::run(
            &self.config,
            &mut self.catalog,
            &mut self.queue,
            self.crypto.as_ref(),
            backup::BackupOptions {
                paths: vec![self.src.clone()],
                timestamp: Some(timestamp),
            },
            None,
        )
        .unwrap()
    }

    fn verify_strict(&mut self) {
        let report = verify::run(
            &mut self.catalog,
            &mut self.queue,
            self.crypto.as_ref(),
            verify::VerifyOptions {
                strict: true,
                repair: false,
            },
            None,
        )
        .unwrap();
        assert!(report.is_clean(), "{report:?}");
    }
}

#[test]
fn lifecycle_plaintext() {
    lifecycle(false)
}

#[test]
fn lifecycle_encrypted() {
    lifecycle(true)
}

fn lifecycle(encrypted: bool) {
    let mut h = Harness::new(encrypted);

    // two snapshots sharing most of their data
    let noise: Vec<u8> = (0..64usize * 12)
        .map(|i| (i as u64).wrapping_mul(0x9E37_79B9).to_le_bytes()[1])
        .collect();
    h.write_source("docs/report.txt", b"quarterly numbers");
    h.write_source("media/noise.bin", &noise);
    let first = h.backup();
    assert!(first.files_added >= 2);

    h.write_source("docs/report.txt", b"quarterly numbers, revised");
    let second = h.backup();
    assert_eq!(second.files_added, 2);

    let infos = list::run(&h.catalog).unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].version, 0);
    assert!(infos[0].timestamp > infos[1].timestamp);

    h.verify_strict();

    // purge the noise file out of every version; auto-compact reclaims its
    // blocks
    let stats = purge::run(
        &h.config,
        &mut h.catalog,
        &mut h.queue,
        h.crypto.as_ref(),
        purge::PurgeOptions {
            filter: purge::PurgeFilter::paths(&["*noise.bin"]).unwrap(),
            time: None,
            versions: vec![],
            dry_run: false,
            no_auto_compact: false,
            no_backend_verification: false,
        },
        None,
    )
    .unwrap();
    assert_eq!(stats.filesets_rewritten, 2);
    assert_eq!(stats.files_removed, 2);
    let compact_stats = stats.compact.expect("auto-compact ran");
    assert!(compact_stats.volumes_rewritten + compact_stats.volumes_deleted >= 1);

    // the catalog no longer knows the file, remote state matches, and both
    // manifests on the backend omit it
    assert_eq!(h.catalog.count_orphan_files().unwrap(), 0);
    assert!(h.catalog.verify_consistency(true).unwrap().is_empty());
    h.verify_strict();

    for volume in h.catalog.remote_volumes().unwrap() {
        use cairn_core::catalog::VolumeState;
        if matches!(volume.state, VolumeState::Uploaded | VolumeState::Verified) {
            assert!(h.backend.exists(&volume.name).unwrap(), "{}", volume.name);
        }
    }

    // a second, identical purge is a no-op
    let again = purge::run(
        &h.config,
        &mut h.catalog,
        &mut h.queue,
        h.crypto.as_ref(),
        purge::PurgeOptions {
            filter: purge::PurgeFilter::paths(&["*noise.bin"]).unwrap(),
            time: None,
            versions: vec![],
            dry_run: false,
            no_auto_compact: false,
            no_backend_verification: false,
        },
        None,
    )
    .unwrap();
    assert_eq!(again.filesets_rewritten, 0);
    assert_eq!(again.volumes_uploaded, 0);

    // a standalone compact finds nothing left to do
    let idle = compact::run(
        &h.config,
        &mut h.catalog,
        &mut h.queue,
        h.crypto.as_ref(),
        compact::CompactOptions::from_config(&h.config),
        None,
    )
    .unwrap();
    assert_eq!(idle.volumes_rewritten, 0);
    assert_eq!(idle.volumes_deleted, 0);
}
