//! The revision store: persistence layer of the database.
//!
//! Layout on disk is a bare git repository:
//! - `docs/<id>` - one JSON record per document (revision metadata + body OID)
//! - `_meta/info` - sequence counter
//! - `_meta/shared_keys` - persisted key-interning table
//! - `_meta/indexes` - persisted index definitions
//! - object database - revision bodies and attachment blobs, content-addressed
//!
//! One transaction is one commit; the main ref advances by compare-and-swap,
//! so another writer shows up as contention rather than lost data.

mod blobs;
mod engine;
mod errors;
mod record;
mod refs;
mod tree;
mod types;

pub use blobs::{BlobKey, BlobReadStream, BlobStore, BlobWriteStream};
pub use engine::{
    ChangeObserver, PutOutcome, PutRequest, RevStore, INDEXES_META, SHARED_KEYS_META,
};
pub use errors::{StorageError, StorageResult};
pub use types::{
    ChangeEntry, DocId, DocumentFlags, InvalidNameError, RawDocument, RevId, StoreOptions,
    StoreSignature, Versioning,
};
