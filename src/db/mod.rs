//! The database: storage handle ownership, document factory, transaction
//! bracketing, and change-notification dispatch.

pub(crate) mod api;
mod observer;

pub use api::{Database, DatabaseConfig, DatabaseError, DatabaseResult, IndexType};
pub use observer::DatabaseChange;
