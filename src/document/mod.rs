//! The in-memory document model.
//!
//! Documents, subdocuments and blobs form a mutable tree of typed property
//! values staged copy-on-write over the binary-encoded body of the
//! persisted revision. Saving resolves conflicts against the revision store
//! and rebases the staged state so container identities survive.

pub(crate) mod blob;
pub(crate) mod document;
mod errors;
pub(crate) mod properties;
mod subdocument;
pub(crate) mod value;

pub use blob::Blob;
pub use document::{ConflictResolver, Document, ListenerToken};
pub use errors::{DocumentError, DocumentResult};
pub use subdocument::Subdocument;
pub use value::{PropertyMap, Value};
