//! Binary attachment values.
//!
//! A blob starts out pending - holding bytes, an unread stream, or a file
//! path - and becomes installed when its enclosing document is saved: the
//! content goes into the database's blob store and the blob is reduced to a
//! content-addressed digest plus metadata. Once installed it belongs to that
//! database and cannot migrate to another one.

use std::fmt;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::Database;
use crate::document::errors::{DocumentError, DocumentResult};
use crate::document::value::{PropertyMap, Value, BLOB_TYPE, TYPE_KEY};
use crate::pack::{PackedDict, PackedValue};
use crate::storage::BlobKey;

pub(crate) const DIGEST_KEY: &str = "digest";
pub(crate) const LENGTH_KEY: &str = "length";
pub(crate) const CONTENT_TYPE_KEY: &str = "content-type";

/// content at or below this size is kept inline after a store read
const INLINE_CACHE_LIMIT: usize = 8 * 1024;

/// A binary attachment value.
///
/// Clone this to share it - clones refer to the same instance.
#[derive(Clone)]
pub struct Blob {
    inner: Arc<BlobInner>,
}

struct BlobInner {
    state: Mutex<BlobState>,
}

struct BlobState {
    content_type: Option<String>,
    length: Option<u64>,
    digest: Option<String>,
    source: BlobSource,
    database: Option<Database>,
    cached: Option<Arc<Vec<u8>>>,
}

enum BlobSource {
    None,
    Bytes(Arc<Vec<u8>>),
    Stream(Option<Box<dyn Read + Send>>),
    File(PathBuf),
}

impl Blob {
    fn from_state(state: BlobState) -> Self {
        Self {
            inner: Arc::new(BlobInner {
                state: Mutex::new(state),
            }),
        }
    }

    /// a pending blob over in-memory content
    pub fn from_bytes(content_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self::from_state(BlobState {
            content_type: Some(content_type.into()),
            length: Some(bytes.len() as u64),
            digest: None,
            source: BlobSource::Bytes(Arc::new(bytes)),
            database: None,
            cached: None,
        })
    }

    /// a pending blob that will drain the stream when first needed
    pub fn from_stream(
        content_type: impl Into<String>,
        stream: impl Read + Send + 'static,
    ) -> Self {
        Self::from_state(BlobState {
            content_type: Some(content_type.into()),
            length: None,
            digest: None,
            source: BlobSource::Stream(Some(Box::new(stream))),
            database: None,
            cached: None,
        })
    }

    /// a pending blob reading its content from a file at save time
    pub fn from_file(content_type: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::from_state(BlobState {
            content_type: Some(content_type.into()),
            length: None,
            digest: None,
            source: BlobSource::File(path.into()),
            database: None,
            cached: None,
        })
    }

    /// rebuild an installed blob from its persisted dictionary
    pub(crate) fn from_packed(dict: &PackedDict, database: Option<Database>) -> DocumentResult<Self> {
        let digest = match dict.get(DIGEST_KEY) {
            Ok(Some(PackedValue::String(s))) => s,
            _ => {
                return Err(DocumentError::InvalidValue(
                    "blob dictionary has no digest".to_string(),
                ))
            }
        };
        let length = match dict.get(LENGTH_KEY) {
            Ok(Some(PackedValue::Int(i))) if i >= 0 => Some(i as u64),
            _ => None,
        };
        let content_type = match dict.get(CONTENT_TYPE_KEY) {
            Ok(Some(PackedValue::String(s))) => Some(s),
            _ => None,
        };
        Ok(Self::from_state(BlobState {
            content_type,
            length,
            digest: Some(digest),
            source: BlobSource::None,
            database,
            cached: None,
        }))
    }

    /// rebuild an installed blob from a plain property map
    pub(crate) fn from_properties(
        map: &PropertyMap,
        database: Option<Database>,
    ) -> DocumentResult<Self> {
        let digest = match map.get(DIGEST_KEY) {
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(DocumentError::InvalidValue(
                    "blob dictionary has no digest".to_string(),
                ))
            }
        };
        let length = match map.get(LENGTH_KEY) {
            Some(value) => match value.as_long() {
                l if l >= 0 => Some(l as u64),
                _ => None,
            },
            None => None,
        };
        let content_type = match map.get(CONTENT_TYPE_KEY) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        Ok(Self::from_state(BlobState {
            content_type,
            length,
            digest: Some(digest),
            source: BlobSource::None,
            database,
            cached: None,
        }))
    }

    pub fn content_type(&self) -> Option<String> {
        self.inner.state.lock().content_type.clone()
    }

    /// content length; 0 until it is known (an undrained stream)
    pub fn length(&self) -> u64 {
        self.inner.state.lock().length.unwrap_or(0)
    }

    /// content-addressed digest; None until installed
    pub fn digest(&self) -> Option<String> {
        self.inner.state.lock().digest.clone()
    }

    /// Full content bytes.
    ///
    /// Installed blobs read from the blob store (small content is cached
    /// inline afterwards); a pending stream is drained and the blob holds
    /// the bytes from then on.
    pub fn content(&self) -> DocumentResult<Vec<u8>> {
        let mut state = self.inner.state.lock();
        if let Some(cached) = &state.cached {
            return Ok((**cached).clone());
        }
        if let Some(digest) = state.digest.clone() {
            let database = state.database.clone().ok_or_else(|| {
                DocumentError::InvalidState("blob is not bound to a database".to_string())
            })?;
            let key = BlobKey::from_string(&digest)?;
            let bytes = database.blob_store().contents(&key)?;
            state.length = Some(bytes.len() as u64);
            if bytes.len() <= INLINE_CACHE_LIMIT {
                state.cached = Some(Arc::new(bytes.clone()));
            }
            return Ok(bytes);
        }
        match &mut state.source {
            BlobSource::Bytes(bytes) => Ok((**bytes).clone()),
            BlobSource::Stream(stream) => {
                let mut reader = stream.take().ok_or_else(|| {
                    DocumentError::InvalidState("blob stream was already consumed".to_string())
                })?;
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                state.length = Some(bytes.len() as u64);
                let shared = Arc::new(bytes);
                state.source = BlobSource::Bytes(shared.clone());
                Ok((*shared).clone())
            }
            BlobSource::File(path) => {
                let bytes = std::fs::read(&*path)?;
                state.length = Some(bytes.len() as u64);
                Ok(bytes)
            }
            BlobSource::None => Err(DocumentError::InvalidState(
                "blob has no content source".to_string(),
            )),
        }
    }

    /// A fresh read stream over the content.
    ///
    /// Installed blobs stream from the blob store; pending bytes and files
    /// are wrapped. A pending stream source cannot be re-streamed.
    pub fn content_stream(&self) -> DocumentResult<Box<dyn Read + Send>> {
        let state = self.inner.state.lock();
        if let Some(digest) = &state.digest {
            let database = state.database.clone().ok_or_else(|| {
                DocumentError::InvalidState("blob is not bound to a database".to_string())
            })?;
            let key = BlobKey::from_string(digest)?;
            return Ok(Box::new(database.blob_store().read_stream(&key)?));
        }
        match &state.source {
            BlobSource::Bytes(bytes) => Ok(Box::new(Cursor::new((**bytes).clone()))),
            BlobSource::File(path) => Ok(Box::new(std::fs::File::open(path)?)),
            BlobSource::Stream(_) => Err(DocumentError::InvalidState(
                "a pending stream blob cannot be re-streamed".to_string(),
            )),
            BlobSource::None => Err(DocumentError::InvalidState(
                "blob has no content source".to_string(),
            )),
        }
    }

    /// Install the content into a database's blob store.
    ///
    /// Idempotent for the same database; installing into a different one
    /// fails, blobs do not migrate.
    pub(crate) fn install(&self, database: &Database) -> DocumentResult<()> {
        let mut state = self.inner.state.lock();
        if state.digest.is_some() {
            match &state.database {
                Some(bound) if !Database::ptr_eq(bound, database) => {
                    return Err(DocumentError::InvalidState(
                        "blob is already installed in a different database".to_string(),
                    ));
                }
                Some(_) => return Ok(()),
                None => {
                    // a decoded reference from this database's own body
                    state.database = Some(database.clone());
                    return Ok(());
                }
            }
        }

        let key = match std::mem::replace(&mut state.source, BlobSource::None) {
            BlobSource::Bytes(bytes) => {
                state.length = Some(bytes.len() as u64);
                let key = database.blob_store().create(&bytes)?;
                state.source = BlobSource::Bytes(bytes);
                key
            }
            BlobSource::Stream(Some(mut reader)) => {
                let mut sink = database.blob_store().write_stream();
                std::io::copy(&mut reader, &mut sink)?;
                state.length = Some(sink.len());
                sink.finish()?
            }
            BlobSource::Stream(None) => {
                return Err(DocumentError::InvalidState(
                    "blob stream was already consumed".to_string(),
                ))
            }
            BlobSource::File(path) => {
                let bytes = std::fs::read(&path)?;
                state.length = Some(bytes.len() as u64);
                database.blob_store().create(&bytes)?
            }
            BlobSource::None => {
                return Err(DocumentError::InvalidState(
                    "blob has no content source".to_string(),
                ))
            }
        };

        state.digest = Some(key.to_string());
        state.database = Some(database.clone());
        Ok(())
    }

    /// the persisted dictionary shape of an installed blob
    pub(crate) fn to_properties(&self) -> DocumentResult<PropertyMap> {
        let state = self.inner.state.lock();
        let digest = state.digest.clone().ok_or_else(|| {
            DocumentError::InvalidState("blob has not been installed yet".to_string())
        })?;
        let mut map = PropertyMap::new();
        map.insert(TYPE_KEY.to_string(), Value::String(BLOB_TYPE.to_string()));
        map.insert(DIGEST_KEY.to_string(), Value::String(digest));
        map.insert(
            LENGTH_KEY.to_string(),
            Value::Int(state.length.unwrap_or(0) as i64),
        );
        if let Some(content_type) = &state.content_type {
            map.insert(
                CONTENT_TYPE_KEY.to_string(),
                Value::String(content_type.clone()),
            );
        }
        Ok(map)
    }
}

/// Digest equality once both sides are installed, identity before.
impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        match (self.digest(), other.digest()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Blob")
            .field("content_type", &state.content_type)
            .field("length", &state.length)
            .field("digest", &state.digest)
            .finish()
    }
}
