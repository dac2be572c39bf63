// Error types for the storage engine.
//
// `DbError` is the single error type returned across every module boundary.
// Corruption variants carry a diagnostic payload (offending location, plus
// checksums when relevant) so a caller can log enough to triage without
// re-reading the container.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DbError>;

/// Diagnostic detail attached to corruption errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionDetail {
    pub location: String,
    pub expected_checksum: Option<u32>,
    pub actual_checksum: Option<u32>,
}

impl std::fmt::Display for CorruptionDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.expected_checksum, self.actual_checksum) {
            (Some(e), Some(a)) => write!(
                f,
                "at {} (expected checksum {:#010x}, found {:#010x})",
                self.location, e, a
            ),
            _ => write!(f, "at {}", self.location),
        }
    }
}

impl CorruptionDetail {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            expected_checksum: None,
            actual_checksum: None,
        }
    }

    pub fn with_checksums(mut self, expected: u32, actual: u32) -> Self {
        self.expected_checksum = Some(expected);
        self.actual_checksum = Some(actual);
        self
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    // --- input / logical ---
    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("parse error: {0}")]
    ParseError(String),

    // --- concurrency ---
    #[error("timed out waiting for the write lock after {waited_ms}ms")]
    WriteLockTimeout { waited_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    /// Reserved for a future multi-writer mode; unreachable under the
    /// single-writer model this engine implements.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    // --- I/O / durability ---
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("disk full while extending the container")]
    DiskFull,

    #[error("no space left in the allocation pool for {requested} page(s)")]
    NoSpace { requested: u32 },

    // --- corruption ---
    #[error("container header is corrupt: {0}")]
    CorruptHeader(String),

    #[error("page corrupt {0}")]
    PageCorrupt(CorruptionDetail),

    #[error("overflow chain corrupt {0}")]
    ChainCorrupt(CorruptionDetail),

    #[error("WAL corrupt {0}")]
    WalCorrupt(CorruptionDetail),

    #[error("blob missing: {0}")]
    BlobMissing(String),

    #[error("blob corrupt: {0}")]
    BlobCorrupt(String),

    #[error("block registry corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("unsupported on-disk version: {0}")]
    UnsupportedVersion(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    // --- resource ---
    #[error("cache exhausted: {0}")]
    CacheExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Internal(format!("encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Internal(format!("decode error: {e}"))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::SchemaError(format!("metadata decode error: {e}"))
    }
}
