pub mod local_backend;

use crate::error::{CairnError, Result};

/// Abstract blob store for remote volumes.
///
/// Keys are plain volume filenames in a flat namespace. Implementations
/// must surface "not found" as `Ok(None)` / `Ok(false)`, never as a generic
/// failure, and must be durable once `put`/`delete` return.
pub trait StorageBackend: Send + Sync {
    /// Read a blob by name. Returns `None` if not found.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write a blob. Overwrites if it already exists.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Delete a blob. Deleting a missing blob is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// Check if a blob exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// List all blob names under a prefix (pass "" for everything).
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size in bytes of a blob. Returns `None` if not found.
    ///
    /// Backends should override this with a metadata-only operation to
    /// avoid downloading the blob.
    fn size(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.get(name)?.map(|v| v.len() as u64))
    }

    /// Create a directory marker (no-op for flat object stores).
    fn create_dir(&self, name: &str) -> Result<()> {
        let _ = name;
        Ok(())
    }
}

/// Build a storage backend from a repository URL.
///
/// Supported formats:
/// - Bare path (`/backups/repo`, `./relative`, `relative`) -> local
/// - `file:///backups/repo` -> local
pub fn backend_from_url(raw: &str) -> Result<Box<dyn StorageBackend>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CairnError::Config("repository URL must not be empty".into()));
    }

    if let Some(path) = trimmed.strip_prefix("file://") {
        if path.is_empty() {
            return Err(CairnError::Config("file:// URL has empty path".into()));
        }
        return Ok(Box::new(local_backend::LocalBackend::new(path)?));
    }

    if trimmed.contains("://") {
        let scheme = trimmed.split("://").next().unwrap_or("");
        return Err(CairnError::Config(format!(
            "unsupported URL scheme: '{scheme}'"
        )));
    }

    Ok(Box::new(local_backend::LocalBackend::new(trimmed)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_is_local() {
        assert!(backend_from_url("/tmp/cairn-test-repo").is_ok());
        assert!(backend_from_url("./relative-repo").is_ok());
    }

    #[test]
    fn file_url_is_local() {
        assert!(backend_from_url("file:///tmp/cairn-test-repo").is_ok());
    }

    #[test]
    fn unknown_scheme_rejected() {
        let err = backend_from_url("ftp://host/path").err().unwrap();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }

    #[test]
    fn empty_url_rejected() {
        assert!(backend_from_url("   ").is_err());
    }
}
