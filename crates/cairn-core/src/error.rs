use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    // --- user input ---
    #[error("refusing to purge with an empty filter (this would remove every file)")]
    EmptyFilter,

    #[error("no filesets match the given time or version selection")]
    NoMatchingVersions,

    #[error("catalog database not found at '{0}'")]
    CatalogNotFound(String),

    // --- catalog state ---
    #[error("catalog is {0}; run a repair before purge or compact")]
    CatalogState(String),

    #[error("catalog has {0} orphan file(s); run verify to repair referential integrity first")]
    OrphanFiles(i64),

    // --- invariants ---
    #[error(
        "no free fileset timestamp in [{candidate}, {limit}); \
         remove the interfering remote volume or select different versions"
    )]
    TimestampCollision { candidate: i64, limit: i64 },

    #[error("remote volume '{name}': illegal state transition {from} -> {to}")]
    IllegalStateTransition {
        name: String,
        from: &'static str,
        to: &'static str,
    },

    // --- backend ---
    #[error("transient backend error: {0}")]
    BackendTransient(String),

    #[error("backend error: {0}")]
    BackendPermanent(String),

    // --- integrity (remote vs catalog) ---
    #[error("remote file '{0}' is not known to the catalog")]
    ExtraRemoteFile(String),

    #[error("remote file '{0}' is missing but the catalog requires it")]
    MissingRemoteFile(String),

    #[error("remote file '{name}' has size {actual} but the catalog records {expected}")]
    RemoteSizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    // --- codec ---
    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("invalid volume format: {0}")]
    InvalidFormat(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    // --- ambient ---
    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("catalog error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// Whether the adapter's retry loop should retry this error.
    pub fn is_transient(&self) -> bool {
        match self {
            CairnError::BackendTransient(_) => true,
            CairnError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CairnError::BackendTransient("timeout".into()).is_transient());
        assert!(
            CairnError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t")).is_transient()
        );
        assert!(!CairnError::BackendPermanent("403".into()).is_transient());
        assert!(!CairnError::EmptyFilter.is_transient());
        assert!(
            !CairnError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "n")).is_transient()
        );
    }
}
