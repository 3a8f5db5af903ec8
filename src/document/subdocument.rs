//! Nested property containers.
//!
//! A subdocument is a property container whose lifecycle is tied to a key
//! inside a parent container. Reading the same key repeatedly yields the
//! same instance until the key is overwritten or the document reloads, and
//! every mutation bubbles up the parent chain to the root document.
//!
//! An instance displaced from its key is invalidated and becomes a detached
//! empty container; it no longer reaches a document and reads as empty.

use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::document::blob::Blob;
use crate::document::document::Document;
use crate::document::errors::DocumentResult;
use crate::document::properties::{self, ContainerInner, ContainerRef};
use crate::document::value::{PropertyMap, Value};

/// A nested property container with observable identity.
///
/// Clone this to share it - clones refer to the same instance.
#[derive(Clone)]
pub struct Subdocument {
    inner: ContainerRef,
}

impl Default for Subdocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Subdocument {
    /// a fresh detached subdocument, adopted when assigned into a container
    pub fn new() -> Self {
        Self {
            inner: ContainerInner::new_detached(),
        }
    }

    pub(crate) fn from_inner(inner: ContainerRef) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &ContainerRef {
        &self.inner
    }

    /// identity comparison; the container API hands out shared instances
    pub fn ptr_eq(a: &Subdocument, b: &Subdocument) -> bool {
        std::sync::Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// whether this subdocument has been saved as part of its parent
    pub fn exists(&self) -> bool {
        self.inner.has_root()
    }

    /// the document this subdocument transitively belongs to
    pub fn document(&self) -> Option<Document> {
        properties::root_document(&self.inner)
    }

    pub fn has_changes(&self) -> bool {
        self.inner.has_changes()
    }

    // ==================== Property access ====================

    pub fn get(&self, key: &str) -> Value {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.inner.get_bool(key)
    }

    pub fn get_long(&self, key: &str) -> i64 {
        self.inner.get_long(key)
    }

    pub fn get_double(&self, key: &str) -> f64 {
        self.inner.get_double(key)
    }

    pub fn get_float(&self, key: &str) -> f32 {
        self.inner.get_float(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.inner.get_string(key)
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        self.inner.get_date(key)
    }

    pub fn get_blob(&self, key: &str) -> Option<Blob> {
        self.inner.get_blob(key)
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<Value>> {
        self.inner.get_array(key)
    }

    pub fn get_subdocument(&self, key: &str) -> Option<Subdocument> {
        self.inner.get_subdocument(key)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> DocumentResult<()> {
        self.inner.set(key, value.into())
    }

    pub fn remove(&self, key: &str) -> DocumentResult<()> {
        self.inner.remove(key)
    }

    pub fn properties(&self) -> PropertyMap {
        self.inner.properties()
    }

    pub fn replace_properties(&self, new: Option<PropertyMap>) -> DocumentResult<()> {
        self.inner.replace_properties(new)
    }

    pub fn revert(&self) {
        self.inner.revert()
    }
}

impl PartialEq for Subdocument {
    fn eq(&self, other: &Self) -> bool {
        Subdocument::ptr_eq(self, other)
    }
}

impl fmt::Debug for Subdocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subdocument")
            .field("exists", &self.exists())
            .field("has_changes", &self.has_changes())
            .finish()
    }
}
