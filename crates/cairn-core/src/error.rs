use thiserror::Error;

use crate::backend::FileType;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("{file_type:?} file '{name}' does not exist")]
    NotFound { file_type: FileType, name: String },

    #[error("ciphertext verification failed")]
    Decrypt,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("blob {id} of type {blob_type:?} not found in index")]
    BlobNotFound {
        blob_type: crate::blob::BlobType,
        id: String,
    },

    #[error("repository is locked: {0}")]
    LockConflict(String),

    #[error("{0}")]
    Fatal(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("repository already initialized")]
    RepoAlreadyExists,

    #[error("wrong passphrase or no usable key found")]
    NoKeyFound,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("no matching ID found for prefix '{0}'")]
    NoIdWithPrefix(String),

    #[error("multiple IDs with prefix '{0}' found")]
    MultipleIdMatches(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("a previous pack upload failed: {0}")]
    UploadFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// Whether this error means "the requested file is absent".
    pub fn is_not_exist(&self) -> bool {
        matches!(self, CairnError::NotFound { .. })
    }

    /// Whether this error is permanent and must not be retried.
    ///
    /// Only transient I/O failures (connection resets, timeouts, …) are worth
    /// another attempt; everything else (bad arguments, decryption failures,
    /// absent files) will fail the same way again.
    pub fn is_permanent(&self) -> bool {
        match self {
            CairnError::Io(e) => !is_retryable_io(e),
            _ => true,
        }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
