use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{CairnError, Result};
use crate::storage::StorageBackend;

/// Storage backend for a local directory using `std::fs` directly.
pub struct LocalBackend {
    root: PathBuf,
}

/// Map a NotFound I/O result to `None`, keeping every other error.
fn ignore_not_found<T>(result: io::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path.
    /// The directory is created on first write, not here.
    pub fn new(root: &str) -> Result<Self> {
        // resolve symlinks when the root already exists so strip_prefix and
        // error messages use the real location; a missing root is fine
        let raw = PathBuf::from(root);
        let root = fs::canonicalize(&raw).unwrap_or(raw);
        Ok(Self { root })
    }

    /// Reject names that could escape the repository root.
    fn validate_name(name: &str) -> Result<()> {
        let reject = |reason: &str| {
            Err(CairnError::InvalidFormat(format!(
                "unsafe blob name '{name}': {reason}"
            )))
        };
        if name.is_empty() {
            return reject("empty");
        }
        if name.contains('\\') {
            return reject("contains a backslash");
        }
        for component in Path::new(name).components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return reject("parent traversal"),
                Component::RootDir | Component::Prefix(_) => return reject("absolute path"),
            }
        }
        Ok(())
    }

    /// Resolve a validated blob name to its path under the root.
    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(name)?;
        ignore_not_found(fs::read(&path))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(name)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        fs::write(&path, data)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.blob_path(name)?;
        // deleting a blob that is already gone is not an error
        ignore_not_found(fs::remove_file(&path))?;
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let path = self.blob_path(name)?;
        let meta = ignore_not_found(fs::metadata(&path))?;
        Ok(meta.is_some_and(|m| m.is_file()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        let path = self.blob_path(name)?;
        let meta = ignore_not_found(fs::metadata(&path))?;
        Ok(meta.and_then(|m| m.is_file().then(|| m.len())))
    }

    fn create_dir(&self, name: &str) -> Result<()> {
        let path = self.blob_path(name.trim_end_matches('/'))?;
        fs::create_dir_all(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_unsafe_names() {
        assert!(LocalBackend::validate_name("/etc/passwd").is_err());
        assert!(LocalBackend::validate_name("../../outside").is_err());
        assert!(LocalBackend::validate_name("foo/../bar").is_err());
        assert!(LocalBackend::validate_name("foo\\bar").is_err());
        assert!(LocalBackend::validate_name("").is_err());
    }

    #[test]
    fn validate_name_accepts_volume_names() {
        assert!(LocalBackend::validate_name("cairn-a1b2c3-b-20250101T120000Z.zst").is_ok());
        assert!(LocalBackend::validate_name("cairn-a1b2c3-f-20250101T120000Z.zst.aes").is_ok());
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("vol-1", b"hello").unwrap();
        assert_eq!(backend.get("vol-1").unwrap().unwrap(), b"hello");
        assert_eq!(backend.size("vol-1").unwrap(), Some(5));
        backend.delete("vol-1").unwrap();
        assert!(backend.get("vol-1").unwrap().is_none());
        // deleting again is not an error
        backend.delete("vol-1").unwrap();
    }

    #[test]
    fn get_and_size_on_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        assert!(backend.get("absent").unwrap().is_none());
        assert_eq!(backend.size("absent").unwrap(), None);
        assert!(!backend.exists("absent").unwrap());
    }

    #[test]
    fn traversal_rejected_on_every_operation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        assert!(backend.get("../../etc/passwd").is_err());
        assert!(backend.put("../escape", b"bad").is_err());
        assert!(backend.delete("/absolute").is_err());
    }

    #[test]
    fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("cairn-aaa", b"1").unwrap();
        backend.put("cairn-bbb", b"2").unwrap();
        backend.put("other-ccc", b"3").unwrap();
        let names = backend.list("cairn-").unwrap();
        assert_eq!(names, vec!["cairn-aaa".to_string(), "cairn-bbb".to_string()]);
        assert_eq!(backend.list("").unwrap().len(), 3);
    }
}
