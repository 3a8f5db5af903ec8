//! Storage layer error types
//!
//! All errors that can occur inside the revision store are defined here.
//! We use `thiserror` for ergonomic error definition and better error messages

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::{DocId, InvalidNameError};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// the requested document record was not found
    #[error("document not found: {0}")]
    DocumentNotFound(DocId),

    /// invalid document id
    #[error("invalid document id: {0}")]
    InvalidDocId(#[from] InvalidNameError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// the specified ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// the main branch moved underneath a committing transaction
    #[error("commit contention: the store head was advanced by another writer")]
    CommitContention,

    /// a write was attempted outside an open transaction
    #[error("operation requires an open transaction")]
    TransactionRequired,

    /// a transaction was opened while one is already active
    #[error("a transaction is already active on this handle")]
    TransactionActive,

    /// the store was opened read-only
    #[error("store is read-only")]
    ReadOnly,

    /// data integrity check failed
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: String, reason: String },

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// store is not initialized at the given path
    #[error("store not initialized: {0}")]
    NotInitialized(PathBuf),

    /// store is empty (no commits)
    #[error("store is empty: no commits found")]
    EmptyStore,

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// attachment blob missing from the object store
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// an encryption key was supplied but encryption is not implemented
    #[error("encryption at rest is not supported")]
    EncryptionUnsupported,

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::DocumentNotFound(_)
                | StorageError::RefNotFound(_)
                | StorageError::CommitNotFound(_)
                | StorageError::BlobNotFound(_)
        )
    }

    /// check if this error is a write/write collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::CommitContention)
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        match self {
            StorageError::CommitContention => true,
            StorageError::Git(e) => e.code() == git2::ErrorCode::Locked,
            _ => false,
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::DocumentNotFound(DocId::new("doc1").unwrap());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let contention = StorageError::CommitContention;
        assert!(!contention.is_not_found());
        assert!(contention.is_conflict());
        assert!(contention.is_retriable());
    }
}
