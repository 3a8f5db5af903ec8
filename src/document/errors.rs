//! Document layer error types

use thiserror::Error;

use crate::pack::PackError;
use crate::storage::StorageError;

/// errors raised by documents, property containers and blobs
#[derive(Debug, Error)]
pub enum DocumentError {
    /// operation targets an unknown document or revision
    #[error("document not found")]
    NotFound,

    /// save or delete could not proceed even after one merge retry,
    /// or a conflict resolver declined to produce a result
    #[error("save conflict could not be resolved")]
    Conflict,

    /// a property was set to an unsupported value
    #[error("invalid property value: {0}")]
    InvalidValue(String),

    /// operation on a closed database, a detached subdocument, or a blob
    /// that is not where the operation needs it to be
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// failure reported by the storage layer
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// a revision body could not be decoded or encoded
    #[error("body encoding error: {0}")]
    Encoding(#[from] PackError),

    /// I/O failure reading blob content from a file or stream
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// result type alias for document operations
pub type DocumentResult<T> = Result<T, DocumentError>;
