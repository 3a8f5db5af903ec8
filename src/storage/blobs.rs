//! Content-addressed attachment store.
//!
//! Attachments are plain blobs in the store's object database; the key IS
//! the content digest, so writing the same bytes twice costs nothing and a
//! key can be checked against its content. Blob writes happen outside
//! transactions - an object that no commit references yet is invisible and
//! harmless, and nothing here ever garbage-collects the object database.

use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use git2::Oid;

use crate::storage::engine::{RevStore, RevStoreInner};
use crate::storage::errors::{StorageError, StorageResult};

/// Content-addressed key of a stored attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobKey(pub(crate) Oid);

impl BlobKey {
    const PREFIX: &'static str = "sha1-";

    /// parse a key from its string form (`sha1-<hex>`)
    pub fn from_string(s: &str) -> StorageResult<Self> {
        let hex = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| StorageError::BlobNotFound(s.to_string()))?;
        let oid = Oid::from_str(hex).map_err(|_| StorageError::BlobNotFound(s.to_string()))?;
        Ok(Self(oid))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

/// Handle to the attachment store of one database.
///
/// Clone this to share it - it uses Arc internally.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<RevStoreInner>,
}

impl RevStore {
    /// the attachment store backed by this store's object database
    pub fn blob_store(&self) -> BlobStore {
        BlobStore {
            inner: self.inner.clone(),
        }
    }
}

impl BlobStore {
    /// Store bytes, returning their content-addressed key.
    pub fn create(&self, bytes: &[u8]) -> StorageResult<BlobKey> {
        let core = self.inner.core.lock();
        Ok(BlobKey(core.repo.blob(bytes)?))
    }

    /// Read the full content for a key.
    pub fn contents(&self, key: &BlobKey) -> StorageResult<Vec<u8>> {
        let core = self.inner.core.lock();
        let blob = core
            .repo
            .find_blob(key.0)
            .map_err(|_| StorageError::BlobNotFound(key.to_string()))?;
        Ok(blob.content().to_vec())
    }

    /// Content length for a key without handing out the bytes.
    pub fn length(&self, key: &BlobKey) -> StorageResult<u64> {
        let core = self.inner.core.lock();
        let blob = core
            .repo
            .find_blob(key.0)
            .map_err(|_| StorageError::BlobNotFound(key.to_string()))?;
        Ok(blob.size() as u64)
    }

    /// A fresh read stream over a stored attachment.
    pub fn read_stream(&self, key: &BlobKey) -> StorageResult<BlobReadStream> {
        Ok(BlobReadStream {
            cursor: Cursor::new(self.contents(key)?),
        })
    }

    /// A sink that accumulates attachment bytes and stores them on `finish`.
    pub fn write_stream(&self) -> BlobWriteStream {
        BlobWriteStream {
            store: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Read stream over one stored attachment.
pub struct BlobReadStream {
    cursor: Cursor<Vec<u8>>,
}

impl Read for BlobReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

/// Write sink producing a content-addressed key.
pub struct BlobWriteStream {
    store: BlobStore,
    buf: Vec<u8>,
}

impl BlobWriteStream {
    /// bytes written so far
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// store the accumulated bytes
    pub fn finish(self) -> StorageResult<BlobKey> {
        self.store.create(&self.buf)
    }
}

impl Write for BlobWriteStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
