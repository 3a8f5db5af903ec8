//! Document record serialization.
//!
//! Each document is one JSON file under `docs/` in the store tree. The file
//! carries the revision metadata and an object-db OID pointing at the binary
//! body blob; the body itself never passes through JSON. Metadata fields use
//! a `_` prefix, which is why user-facing document ids may not start with one.

use git2::Oid;
use serde::{Deserialize, Serialize};

use crate::storage::errors::{StorageError, StorageResult};
use crate::storage::types::{DocId, RevId};

/// a stored document record
#[derive(Debug, Clone, PartialEq)]
pub struct DocRecord {
    pub id: DocId,
    pub rev_id: RevId,
    pub sequence: u64,
    pub deleted: bool,
    pub has_attachments: bool,
    /// OID of the body blob; None when the body is empty (deletion tombstone)
    pub body_oid: Option<Oid>,
}

/// internal format for JSON serialization
#[derive(Serialize, Deserialize)]
struct RecordJson {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_rev")]
    rev: RevId,
    #[serde(rename = "_seq")]
    seq: u64,
    #[serde(rename = "_deleted")]
    deleted: bool,
    #[serde(rename = "_attachments")]
    has_attachments: bool,
    #[serde(rename = "_body")]
    body: Option<String>,
}

/// serialize a record to JSON bytes
pub fn serialize_record(record: &DocRecord) -> StorageResult<Vec<u8>> {
    let json = RecordJson {
        id: record.id.as_str().to_string(),
        rev: record.rev_id.clone(),
        seq: record.sequence,
        deleted: record.deleted,
        has_attachments: record.has_attachments,
        body: record.body_oid.map(|oid| oid.to_string()),
    };

    let bytes = serde_json::to_vec_pretty(&json)?;
    Ok(bytes)
}

/// deserialize a record from JSON bytes
///
/// validates that the id in the JSON matches the tree entry it was read from
pub fn deserialize_record(bytes: &[u8], expected_id: &DocId) -> StorageResult<DocRecord> {
    let json: RecordJson = serde_json::from_slice(bytes)?;

    if json.id != expected_id.as_str() {
        return Err(StorageError::CorruptedData {
            path: format!("docs/{}", expected_id),
            reason: format!(
                "id mismatch: entry name suggests '{}' but record has '{}'",
                expected_id, json.id
            ),
        });
    }

    let body_oid = match json.body {
        Some(hex) => Some(Oid::from_str(&hex).map_err(|_| StorageError::CorruptedData {
            path: format!("docs/{}", expected_id),
            reason: format!("invalid body oid '{}'", hex),
        })?),
        None => None,
    };

    Ok(DocRecord {
        id: expected_id.clone(),
        rev_id: json.rev,
        sequence: json.seq,
        deleted: json.deleted,
        has_attachments: json.has_attachments,
        body_oid,
    })
}
