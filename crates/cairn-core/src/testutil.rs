use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;
use crate::commands::backup::{self, BackupOptions, BackupStats};
use crate::config::{
    CairnConfig, CompactConfig, CompressionConfig, EncryptionConfig, RepositoryConfig, RetryConfig,
};
use crate::crypto::{CryptoEngine, PlaintextEngine};
use crate::error::{CairnError, Result};
use crate::remote::RemoteQueue;
use crate::storage::StorageBackend;

/// In-memory storage backend for testing. Thread-safe via Mutex.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn blob_count(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(name).cloned())
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(name))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        let mut names: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(name).map(|v| v.len() as u64))
    }
}

/// Wraps a `MemoryBackend` and fails the next N `put` calls, for retry and
/// crash-recovery tests. `transient` selects the error class.
pub struct FailingBackend {
    pub inner: Arc<MemoryBackend>,
    failures_left: AtomicUsize,
    transient: bool,
}

impl FailingBackend {
    pub fn new(inner: Arc<MemoryBackend>, failures: usize, transient: bool) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            transient,
        }
    }

    pub fn set_failures(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            if self.transient {
                return Err(CairnError::BackendTransient("injected failure".into()));
            }
            return Err(CairnError::BackendPermanent("injected failure".into()));
        }
        Ok(())
    }
}

impl StorageBackend for FailingBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(name)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.maybe_fail()?;
        self.inner.put(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        self.inner.size(name)
    }
}

/// Small block and volume sizes so tests exercise multi-block and
/// multi-volume paths with tiny fixtures.
pub const TEST_BLOCKSIZE: u32 = 64;
pub const TEST_VOLUME_SIZE: u32 = 4096;

pub fn test_config() -> CairnConfig {
    CairnConfig {
        repository: RepositoryConfig {
            url: ":memory:".into(),
        },
        catalog: ":memory:".into(),
        encryption: EncryptionConfig::default(),
        compression: CompressionConfig::default(),
        blocksize: TEST_BLOCKSIZE,
        volume_size: TEST_VOLUME_SIZE,
        prefix: "cairn".into(),
        compact: CompactConfig::default(),
        retry: RetryConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            retry_max_delay_ms: 4,
        },
    }
}

/// A complete in-memory repository: catalog, queue, backend, and a source
/// directory whose contents `backup_tree` snapshots.
pub struct TestRepo {
    pub config: CairnConfig,
    pub catalog: Catalog,
    pub queue: RemoteQueue,
    pub backend: Arc<MemoryBackend>,
    pub crypto: Arc<dyn CryptoEngine>,
    pub src_dir: tempfile::TempDir,
    /// Synthetic snapshot clock, stepped by a fixed gap per backup so purge
    /// tests have room to probe replacement timestamps.
    clock: i64,
}

/// 2025-01-01T00:00:00Z.
const TEST_EPOCH: i64 = 1_735_689_600;
/// Seconds between synthetic snapshots.
const TEST_SNAPSHOT_GAP: i64 = 1000;

impl TestRepo {
    pub fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        Self::with_storage(backend.clone(), backend)
    }

    /// Build a repo whose queue talks to `storage` (e.g. a `FailingBackend`)
    /// while `backend` is the underlying store tests can inspect.
    pub fn with_storage(backend: Arc<MemoryBackend>, storage: Arc<dyn StorageBackend>) -> Self {
        let config = test_config();
        let catalog =
            Catalog::open_in_memory(config.blocksize, &config.prefix).expect("in-memory catalog");
        let queue = RemoteQueue::new(storage, config.retry.clone());
        Self {
            config,
            catalog,
            queue,
            backend,
            crypto: Arc::new(PlaintextEngine),
            src_dir: tempfile::tempdir().expect("tempdir"),
            clock: TEST_EPOCH,
        }
    }

    /// Write the given (relative path, content) pairs into the source
    /// directory and back it up as a new fileset. Unchanged files are left
    /// untouched so their mtimes (and metadata blocks) stay stable across
    /// snapshots.
    pub fn backup_tree(&mut self, files: &[(&str, &[u8])]) -> BackupStats {
        for (rel, content) in files {
            let path = self.src_dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            if fs::read(&path).ok().as_deref() != Some(*content) {
                fs::write(&path, content).unwrap();
            }
        }
        let timestamp = chrono::DateTime::from_timestamp(self.clock, 0).unwrap();
        self.clock += TEST_SNAPSHOT_GAP;
        backup::run(
            &self.config,
            &mut self.catalog,
            &mut self.queue,
            self.crypto.as_ref(),
            BackupOptions {
                paths: vec![self.src_dir.path().to_path_buf()],
                timestamp: Some(timestamp),
            },
            None,
        )
        .expect("backup")
    }

    /// Remove a file from the source directory (next backup drops it).
    pub fn remove_source_file(&self, rel: &str) {
        fs::remove_file(self.src_dir.path().join(rel)).unwrap();
    }

    /// The absolute path string a source file was recorded under.
    pub fn source_path(&self, rel: &str) -> String {
        self.src_dir
            .path()
            .join(rel)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Non-repeating filler so fixed-size chunking yields distinct blocks
/// instead of deduplicating everything to one.
pub fn varied(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let mixed = (i as u64)
                .wrapping_add(seed as u64)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15);
            (mixed >> 56) as u8
        })
        .collect()
}
