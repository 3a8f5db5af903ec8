//! Vellum - an embedded document database.
//!
//! Documents are schemaless maps of typed property values with multi-version
//! revision tracking. Mutations are staged copy-on-write on top of the
//! binary-encoded body of the currently persisted revision; saving submits a
//! new revision and resolves write conflicts deterministically when the same
//! document was changed from somewhere else in the meantime.
//!
//! # Example
//!
//! ```no_run
//! use vellum::{Database, DatabaseConfig};
//!
//! let db = Database::open(DatabaseConfig::new("./my_database")).unwrap();
//! let doc = db.create_document().unwrap();
//! doc.set("name", "Alice").unwrap();
//! doc.set("age", 30i64).unwrap();
//! doc.save().unwrap();
//! ```

pub mod db;
pub mod document;
pub mod pack;
pub mod storage;

pub use db::{Database, DatabaseChange, DatabaseConfig, DatabaseError, IndexType};
pub use document::{
    Blob, ConflictResolver, Document, DocumentError, PropertyMap, Subdocument, Value,
};
pub use storage::{RevId, StorageError};
