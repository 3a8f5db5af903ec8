//! Database API - high-level interface to a vellum database.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::observer::DatabaseChange;
use crate::document::document::DocInner;
use crate::document::{ConflictResolver, Document, DocumentError, ListenerToken};
use crate::pack::SharedKeys;
use crate::storage::{
    BlobStore, ChangeObserver, DocId, InvalidNameError, RevStore, StorageError, StoreOptions,
    Versioning, INDEXES_META, SHARED_KEYS_META,
};

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("invalid document id: {0}")]
    InvalidDocId(#[from] InvalidNameError),

    #[error("database is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Database configuration options.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database directory.
    pub path: PathBuf,
    /// Create if doesn't exist.
    pub create_if_missing: bool,
    /// Reject writes.
    pub read_only: bool,
    /// Document versioning scheme.
    pub versioning: Versioning,
    /// Encryption hook; opening fails when set.
    pub encryption_key: Option<Vec<u8>>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".vellum"),
            create_if_missing: true,
            read_only: false,
            versioning: Versioning::default(),
            encryption_key: None,
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Set read_only flag.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Set the encryption key hook.
    pub fn encryption_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.encryption_key = key;
        self
    }
}

/// kind of a persisted index definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    Value,
    FullText,
}

#[derive(Serialize, Deserialize)]
struct IndexDef {
    expressions: Vec<String>,
    index_type: IndexType,
}

pub(crate) struct DbInner {
    pub(crate) config: DatabaseConfig,
    pub(crate) store: RevStore,
    pub(crate) blobs: BlobStore,
    pub(crate) shared_keys: SharedKeys,
    pub(crate) state: Mutex<DbState>,
}

#[derive(Default)]
pub(crate) struct DbState {
    pub(crate) closed: bool,
    pub(crate) persisted_key_count: usize,
    /// documents with staged changes, reported at close
    pub(crate) unsaved: HashMap<String, Weak<DocInner>>,
    /// all live documents, for routing external changes
    pub(crate) registry: HashMap<String, Vec<Weak<DocInner>>>,
    pub(crate) listeners: Vec<(u64, Arc<dyn Fn(&DatabaseChange) + Send + Sync>)>,
    pub(crate) next_token: u64,
    pub(crate) default_resolver: Option<Arc<dyn ConflictResolver>>,
    pub(crate) observer: Option<Arc<ChangeObserver>>,
}

/// The main database handle.
///
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Open (or create) a database at the configured path.
    pub fn open(config: DatabaseConfig) -> DatabaseResult<Database> {
        let store = RevStore::open(
            &config.path,
            StoreOptions {
                create: config.create_if_missing,
                read_only: config.read_only,
                versioning: config.versioning,
                encryption_key: config.encryption_key.clone(),
            },
        )?;
        let blobs = store.blob_store();
        let shared_keys = SharedKeys::new();

        let inner = Arc::new(DbInner {
            config,
            store,
            blobs,
            shared_keys,
            state: Mutex::new(DbState::default()),
        });
        let db = Database { inner };
        db.reload_shared_keys()?;

        // one storage observer per database; change dispatch fans out from it
        let weak = Arc::downgrade(&db.inner);
        let observer = db.inner.store.observe(move || {
            if let Some(inner) = weak.upgrade() {
                Database { inner }.dispatch_changes();
            }
        });
        db.inner.state.lock().observer = Some(Arc::new(observer));

        debug!(path = %db.inner.config.path.display(), "database opened");
        Ok(db)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    pub fn is_open(&self) -> bool {
        !self.inner.state.lock().closed
    }

    /// identity comparison between handles
    pub fn ptr_eq(a: &Database, b: &Database) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn ensure_open(&self) -> DatabaseResult<()> {
        if self.inner.state.lock().closed {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn ensure_open_doc(&self) -> Result<(), DocumentError> {
        if self.inner.state.lock().closed {
            Err(DocumentError::InvalidState("database is closed".to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn store(&self) -> &RevStore {
        &self.inner.store
    }

    /// the attachment store of this database
    pub fn blob_store(&self) -> BlobStore {
        self.inner.blobs.clone()
    }

    pub(crate) fn shared_keys(&self) -> SharedKeys {
        self.inner.shared_keys.clone()
    }

    // ==================== Documents ====================

    /// Get a document handle; a fresh unsaved one when the id is unknown.
    pub fn get_document(&self, id: &str) -> DatabaseResult<Document> {
        self.ensure_open()?;
        let id = DocId::new(id)?;
        self.reload_shared_keys()?;
        let raw = self.inner.store.get_document(&id)?;
        let doc = Document::from_parts(self.clone(), id, raw)?;
        self.register_document(&doc);
        Ok(doc)
    }

    /// Get a document only if it has been saved before.
    pub fn get_existing_document(&self, id: &str) -> DatabaseResult<Option<Document>> {
        self.ensure_open()?;
        let id = DocId::new(id)?;
        self.reload_shared_keys()?;
        match self.inner.store.get_document(&id)? {
            Some(raw) => {
                let doc = Document::from_parts(self.clone(), id, Some(raw))?;
                self.register_document(&doc);
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Create a document with a fresh random id.
    pub fn create_document(&self) -> DatabaseResult<Document> {
        self.ensure_open()?;
        let doc = Document::from_parts(self.clone(), DocId::generate(), None)?;
        self.register_document(&doc);
        Ok(doc)
    }

    fn register_document(&self, doc: &Document) {
        let mut state = self.inner.state.lock();
        let slot = state.registry.entry(doc.id().to_string()).or_default();
        slot.retain(|weak| weak.strong_count() > 0);
        slot.push(doc.downgrade());
    }

    pub(crate) fn note_unsaved(&self, doc: &Document) {
        let mut state = self.inner.state.lock();
        state.unsaved.insert(doc.id().to_string(), doc.downgrade());
    }

    pub(crate) fn clear_unsaved(&self, id: &str) {
        self.inner.state.lock().unsaved.remove(id);
    }

    // ==================== Transactions ====================

    /// Run `f` inside one storage transaction.
    ///
    /// Saves made inside the closure commit together; change notifications
    /// are dispatched once, after the commit. An error rolls everything
    /// back before re-raising.
    pub fn in_batch<T>(&self, f: impl FnOnce() -> DatabaseResult<T>) -> DatabaseResult<T> {
        self.ensure_open()?;
        self.begin_batch()?;
        match f() {
            Ok(value) => {
                self.inner.store.end_transaction(true)?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback) = self.inner.store.end_transaction(false) {
                    warn!(error = %rollback, "rollback failed");
                }
                let _ = self.reload_shared_keys();
                Err(error)
            }
        }
    }

    pub(crate) fn begin_batch(&self) -> Result<(), DocumentError> {
        self.ensure_open_doc()?;
        self.inner.store.begin_transaction()?;
        if let Err(error) = self.reload_shared_keys_doc() {
            let _ = self.inner.store.end_transaction(false);
            return Err(error);
        }
        Ok(())
    }

    /// run `f` in the caller's transaction, or bracket one just for it
    pub(crate) fn with_write_txn<T>(
        &self,
        f: impl FnOnce() -> Result<T, DocumentError>,
    ) -> Result<T, DocumentError> {
        if self.inner.store.is_in_transaction() {
            return f();
        }
        self.begin_batch()?;
        match f() {
            Ok(value) => {
                self.inner.store.end_transaction(true)?;
                Ok(value)
            }
            Err(error) => {
                let _ = self.inner.store.end_transaction(false);
                let _ = self.reload_shared_keys();
                Err(error)
            }
        }
    }

    // ==================== Shared keys ====================

    fn reload_shared_keys(&self) -> DatabaseResult<()> {
        self.reload_shared_keys_doc().map_err(DatabaseError::from)
    }

    /// refresh the key table from storage so ids stay aligned with what
    /// other handles of the same database persisted
    pub(crate) fn reload_shared_keys_doc(&self) -> Result<(), DocumentError> {
        if let Some(bytes) = self.inner.store.read_meta(SHARED_KEYS_META)? {
            let stored: Vec<String> =
                serde_json::from_slice(&bytes).map_err(StorageError::from)?;
            self.inner.shared_keys.merge_from(&stored)?;
            self.inner.state.lock().persisted_key_count = stored.len();
        }
        Ok(())
    }

    /// stage the key table for commit when it grew since the last persist
    pub(crate) fn persist_shared_keys(&self) -> Result<(), DocumentError> {
        let persisted = self.inner.state.lock().persisted_key_count;
        if self.inner.shared_keys.count() <= persisted {
            return Ok(());
        }
        let snapshot = self.inner.shared_keys.snapshot();
        let bytes = serde_json::to_vec(&snapshot).map_err(StorageError::from)?;
        self.inner.store.put_meta(SHARED_KEYS_META, &bytes)?;
        self.inner.state.lock().persisted_key_count = snapshot.len();
        Ok(())
    }

    // ==================== Conflict resolution ====================

    /// default resolver for documents without their own
    pub fn set_default_conflict_resolver(&self, resolver: Option<Arc<dyn ConflictResolver>>) {
        self.inner.state.lock().default_resolver = resolver;
    }

    pub(crate) fn default_resolver(&self) -> Option<Arc<dyn ConflictResolver>> {
        self.inner.state.lock().default_resolver.clone()
    }

    // ==================== Change observation ====================

    /// Register a change listener.
    ///
    /// Fires one event per committed batch with the affected document ids;
    /// external batches carry the flag.
    pub fn add_change_listener(
        &self,
        listener: impl Fn(&DatabaseChange) + Send + Sync + 'static,
    ) -> ListenerToken {
        let mut state = self.inner.state.lock();
        state.next_token += 1;
        let token = ListenerToken(state.next_token);
        state.listeners.push((token.0, Arc::new(listener)));
        token
    }

    pub fn remove_change_listener(&self, token: ListenerToken) {
        self.inner
            .state
            .lock()
            .listeners
            .retain(|(t, _)| *t != token.0);
    }

    /// Check for changes made by other handles of the same database now.
    pub fn poll_changes(&self) -> DatabaseResult<()> {
        self.ensure_open()?;
        self.inner.store.poll_external()?;
        Ok(())
    }

    // ==================== Indexes ====================

    /// Create (or replace) a named index over the given expressions.
    pub fn create_index(
        &self,
        name: &str,
        expressions: Vec<String>,
        index_type: IndexType,
    ) -> DatabaseResult<()> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(DatabaseError::InvalidConfig(
                "index name may not be empty".to_string(),
            ));
        }
        self.with_write_txn(|| {
            let mut indexes = self.read_indexes()?;
            indexes.insert(
                name.to_string(),
                IndexDef {
                    expressions,
                    index_type,
                },
            );
            let bytes = serde_json::to_vec(&indexes).map_err(StorageError::from)?;
            self.inner.store.put_meta(INDEXES_META, &bytes)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Delete a named index; returns whether it existed.
    pub fn delete_index(&self, name: &str) -> DatabaseResult<bool> {
        self.ensure_open()?;
        let mut removed = false;
        self.with_write_txn(|| {
            let mut indexes = self.read_indexes()?;
            removed = indexes.remove(name).is_some();
            if removed {
                let bytes = serde_json::to_vec(&indexes).map_err(StorageError::from)?;
                self.inner.store.put_meta(INDEXES_META, &bytes)?;
            }
            Ok(())
        })?;
        Ok(removed)
    }

    /// Names of all persisted indexes.
    pub fn index_names(&self) -> DatabaseResult<Vec<String>> {
        self.ensure_open()?;
        let indexes = self.read_indexes()?;
        Ok(indexes.keys().cloned().collect())
    }

    fn read_indexes(&self) -> Result<BTreeMap<String, IndexDef>, DocumentError> {
        match self.inner.store.read_meta(INDEXES_META)? {
            Some(bytes) => {
                Ok(serde_json::from_slice(&bytes).map_err(StorageError::from)?)
            }
            None => Ok(BTreeMap::new()),
        }
    }

    // ==================== Lifecycle ====================

    /// Close the database, reporting the ids of documents with unsaved
    /// changes (their staged state is abandoned).
    pub fn close(&self) -> DatabaseResult<Vec<String>> {
        let unsaved = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(Vec::new());
            }
            state.closed = true;
            let unsaved: Vec<String> = state.unsaved.keys().cloned().collect();
            state.unsaved.clear();
            state.registry.clear();
            state.listeners.clear();
            state.observer = None;
            unsaved
        };
        if !unsaved.is_empty() {
            warn!(
                count = unsaved.len(),
                "closing database with unsaved documents"
            );
        }
        debug!(path = %self.inner.config.path.display(), "database closed");
        Ok(unsaved)
    }

    /// Close the database and remove it from disk.
    pub fn delete(&self) -> DatabaseResult<()> {
        self.close()?;
        RevStore::delete_at_path(&self.inner.config.path)?;
        Ok(())
    }

    /// Remove a database directory without opening it.
    pub fn delete_at_path(path: impl AsRef<Path>) -> DatabaseResult<()> {
        RevStore::delete_at_path(path)?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.config.path)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::value::map_content_eq;
    use crate::document::{Blob, PropertyMap, Subdocument, Value};
    use std::io::Read;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        (dir, db)
    }

    fn reopen(dir: &TempDir) -> Database {
        Database::open(DatabaseConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn test_new_document() {
        let (_dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();

        assert!(!doc.exists());
        assert!(!doc.is_deleted());
        assert!(doc.properties().is_empty());
        assert!(!doc.get_bool("missing"));
        assert_eq!(doc.get_long("missing"), 0);
        assert_eq!(doc.get_double("missing"), 0.0);
        assert_eq!(doc.get_float("missing"), 0.0);
        assert!(doc.get_string("missing").is_none());
        assert!(doc.get_date("missing").is_none());
        assert!(doc.get_blob("missing").is_none());
        assert!(doc.get_array("missing").is_none());
        assert!(doc.get_subdocument("missing").is_none());

        doc.save().unwrap();
        assert!(doc.exists());
        assert!(!doc.is_deleted());
        assert!(doc.properties().is_empty());
        assert_eq!(doc.sequence(), 1);
    }

    #[test]
    fn test_property_accessors() {
        let (dir, db) = setup();
        let doc = db.get_document("profile").unwrap();

        doc.set("bool", true).unwrap();
        doc.set("double", 1.1f64).unwrap();
        doc.set("float", 1.2f32).unwrap();
        doc.set("integer", 2i64).unwrap();
        doc.set("string", "str").unwrap();
        doc.set("array", vec![Value::from("1"), Value::from("2")])
            .unwrap();
        let date = chrono::DateTime::parse_from_rfc3339("2024-06-01T10:30:00.5+02:00").unwrap();
        doc.set("date", date).unwrap();
        doc.save().unwrap();

        // read back through a second database instance
        let db2 = reopen(&dir);
        let doc2 = db2.get_existing_document("profile").unwrap().unwrap();
        assert!(doc2.get_bool("bool"));
        assert_eq!(doc2.get_double("double"), 1.1);
        assert_eq!(doc2.get_float("float"), 1.2);
        assert_eq!(doc2.get_long("integer"), 2);
        assert_eq!(doc2.get_string("string").as_deref(), Some("str"));
        assert_eq!(
            doc2.get_array("array").unwrap(),
            vec![Value::from("1"), Value::from("2")]
        );
        assert_eq!(doc2.get_date("date"), Some(date));
    }

    #[test]
    fn test_set_get_and_save_clear_changes() {
        let (_dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        doc.set("k", 42i64).unwrap();
        assert_eq!(doc.get_long("k"), 42);
        assert!(doc.has_changes());

        doc.save().unwrap();
        assert!(!doc.has_changes());
        assert_eq!(doc.get_long("k"), 42);
    }

    #[test]
    fn test_remove_properties() {
        let (_dir, db) = setup();
        let doc = db.get_document("profile").unwrap();
        doc.set("type", "profile").unwrap();
        doc.set("name", "Jason").unwrap();
        doc.set("weight", 130.5f64).unwrap();
        doc.set("age", 30i64).unwrap();
        doc.set("active", true).unwrap();
        let mut address = PropertyMap::new();
        address.insert("street".into(), Value::from("1 milky way."));
        address.insert("city".into(), Value::from("galaxy city"));
        address.insert("zip".into(), Value::from(12345i64));
        doc.set("address", Value::Dict(address)).unwrap();
        doc.save().unwrap();

        doc.remove("name").unwrap();
        doc.remove("weight").unwrap();
        doc.remove("age").unwrap();
        doc.remove("active").unwrap();
        doc.get_subdocument("address").unwrap().remove("city").unwrap();

        assert!(doc.get_string("name").is_none());
        assert_eq!(doc.get_double("weight"), 0.0);
        assert_eq!(doc.get_long("age"), 0);
        assert!(!doc.get_bool("active"));
        assert!(!doc.contains("name"));

        doc.save().unwrap();

        let props = doc.properties();
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("type"), Some(&Value::from("profile")));
        let address = doc.get_subdocument("address").unwrap();
        assert_eq!(address.get_string("street").as_deref(), Some("1 milky way."));
        assert_eq!(address.get_long("zip"), 12345);
        assert!(!address.contains("city"));
        assert_eq!(address.properties().len(), 2);
    }

    #[test]
    fn test_mutation_listener_fires_per_mutation() {
        let (_dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        let token = doc.on_mutation(move |_| *sink.lock() += 1);

        doc.set("a", 1i64).unwrap();
        doc.set("b", 2i64).unwrap();
        let mut address = PropertyMap::new();
        address.insert("city".into(), Value::from("x"));
        doc.set("address", Value::Dict(address)).unwrap();
        // nested mutations bubble up to the document
        doc.get_subdocument("address")
            .unwrap()
            .set("city", "y")
            .unwrap();
        assert_eq!(*count.lock(), 4);

        doc.remove_listener(token);
        doc.set("c", 3i64).unwrap();
        assert_eq!(*count.lock(), 4);
    }

    #[test]
    fn test_revert() {
        let (_dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        doc.set("name", "first").unwrap();
        doc.save().unwrap();

        doc.set("name", "second").unwrap();
        doc.revert();
        assert!(!doc.has_changes());
        assert_eq!(doc.get_string("name").as_deref(), Some("first"));
    }

    #[test]
    fn test_delete() {
        let (dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();

        // deleting a never-saved document is an error
        assert!(matches!(doc.delete(), Err(DocumentError::NotFound)));

        doc.set("name", "x").unwrap();
        doc.save().unwrap();
        doc.delete().unwrap();

        assert!(doc.exists());
        assert!(doc.is_deleted());
        assert!(doc.properties().is_empty());
        assert!(doc.get_string("name").is_none());

        // the tombstone is persisted
        let doc2 = reopen(&dir).get_document("doc1").unwrap();
        assert!(doc2.exists());
        assert!(doc2.is_deleted());
        assert!(doc2.properties().is_empty());
    }

    #[test]
    fn test_purge() {
        let (_dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        doc.set("name", "x").unwrap();
        doc.save().unwrap();

        assert!(doc.purge().unwrap());
        assert!(!doc.exists());
        assert!(!doc.is_deleted());
        assert!(doc.properties().is_empty());
        assert!(db.get_existing_document("doc1").unwrap().is_none());

        // nothing left to purge
        assert!(!doc.purge().unwrap());
    }

    #[test]
    fn test_subdocument_identity_survives_save() {
        let (_dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        let mut address = PropertyMap::new();
        address.insert("city".into(), Value::from("Berlin"));
        doc.set("address", Value::Dict(address)).unwrap();

        let before = doc.get_subdocument("address").unwrap();
        assert!(!before.exists());
        doc.save().unwrap();

        let after = doc.get_subdocument("address").unwrap();
        assert!(Subdocument::ptr_eq(&before, &after));
        assert!(after.exists());
        assert_eq!(after.get_string("city").as_deref(), Some("Berlin"));
        assert!(std::sync::Arc::ptr_eq(
            &after.document().unwrap().database().inner,
            &db.inner
        ));
    }

    #[test]
    fn test_replace_properties_roundtrip() {
        let (dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();

        let mut nested = PropertyMap::new();
        nested.insert("street".into(), Value::from("1 milky way."));
        let mut map = PropertyMap::new();
        map.insert("type".into(), Value::from("profile"));
        map.insert("score".into(), Value::from(7.5f64));
        map.insert("address".into(), Value::Dict(nested));
        map.insert(
            "tags".into(),
            Value::Array(vec![Value::from("a"), Value::from("b")]),
        );
        doc.replace_properties(Some(map.clone())).unwrap();
        doc.save().unwrap();

        let doc2 = reopen(&dir).get_document("doc1").unwrap();
        assert!(map_content_eq(&doc2.properties(), &map));

        // full replacement removes what the new map omits
        let mut smaller = PropertyMap::new();
        smaller.insert("type".into(), Value::from("profile"));
        doc.replace_properties(Some(smaller.clone())).unwrap();
        doc.save().unwrap();
        let doc3 = reopen(&dir).get_document("doc1").unwrap();
        assert!(map_content_eq(&doc3.properties(), &smaller));
    }

    #[test]
    fn test_conflict_resolvers() {
        let (dir, db) = setup();
        let doc = db.get_document("user").unwrap();
        doc.set("type", "profile").unwrap();
        doc.set("name", "Scott").unwrap();
        doc.save().unwrap();

        // another handle of the same database moves the document forward
        let db2 = reopen(&dir);
        let other = db2.get_document("user").unwrap();
        other.set("name", "Scotty").unwrap();
        other.save().unwrap();

        // theirs-wins resolver
        doc.set_conflict_resolver(Some(Arc::new(
            |_mine: &PropertyMap, theirs: &PropertyMap, _base: &PropertyMap| Some(theirs.clone()),
        )));
        doc.set("name", "Scott Pilgrim").unwrap();
        doc.save().unwrap();
        assert_eq!(doc.get_string("name").as_deref(), Some("Scotty"));
        assert_eq!(doc.get_string("type").as_deref(), Some("profile"));
        assert!(!doc.has_changes());

        // merge resolver: theirs wins per colliding key, mine's additions kept
        doc.set_conflict_resolver(Some(Arc::new(
            |mine: &PropertyMap, theirs: &PropertyMap, _base: &PropertyMap| {
                let mut merged = theirs.clone();
                for (key, value) in mine {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
                Some(merged)
            },
        )));
        let other = db2.get_document("user").unwrap();
        other.set("name", "Scotty II").unwrap();
        other.save().unwrap();

        doc.set("name", "loser").unwrap();
        doc.set("age", 30i64).unwrap();
        doc.save().unwrap();
        assert_eq!(doc.get_string("name").as_deref(), Some("Scotty II"));
        assert_eq!(doc.get_long("age"), 30);

        let check = reopen(&dir).get_document("user").unwrap();
        assert_eq!(check.get_string("name").as_deref(), Some("Scotty II"));
        assert_eq!(check.get_long("age"), 30);
    }

    #[test]
    fn test_conflict_resolver_giving_up() {
        let (dir, db) = setup();
        let doc = db.get_document("user").unwrap();
        doc.set("name", "a").unwrap();
        doc.save().unwrap();

        let other = reopen(&dir).get_document("user").unwrap();
        other.set("name", "b").unwrap();
        other.save().unwrap();

        doc.set_conflict_resolver(Some(Arc::new(
            |_: &PropertyMap, _: &PropertyMap, _: &PropertyMap| None,
        )));
        doc.set("name", "c").unwrap();
        assert!(matches!(doc.save(), Err(DocumentError::Conflict)));
    }

    #[test]
    fn test_conflict_mine_is_deeper() {
        let (dir, db) = setup();
        let doc = db.get_document("counter").unwrap();
        doc.set("name", "start").unwrap();
        doc.save().unwrap();

        // one external update, then two in-memory saves: mine is deeper
        let db2 = reopen(&dir);
        let other = db2.get_document("counter").unwrap();
        other.set("name", "external").unwrap();
        other.save().unwrap();

        doc.set("name", "mine1").unwrap();
        doc.save().unwrap();
        doc.set("name", "mine2").unwrap();
        doc.save().unwrap();
        assert_eq!(doc.get_string("name").as_deref(), Some("mine2"));
        let check = reopen(&dir).get_document("counter").unwrap();
        assert_eq!(check.get_string("name").as_deref(), Some("mine2"));

        // two external revisions ahead: theirs wins
        let doc_b = db.get_document("counter2").unwrap();
        doc_b.set("name", "start").unwrap();
        doc_b.save().unwrap();

        let other = db2.get_document("counter2").unwrap();
        other.set("name", "ext1").unwrap();
        other.save().unwrap();
        other.set("name", "ext2").unwrap();
        other.save().unwrap();

        doc_b.set("name", "mine").unwrap();
        doc_b.save().unwrap();
        assert_eq!(doc_b.get_string("name").as_deref(), Some("ext2"));
        assert!(!doc_b.has_changes());
    }

    #[test]
    fn test_blob_roundtrip() {
        let (dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        doc.set("data", Blob::from_bytes("text/plain", "12345")).unwrap();
        doc.save().unwrap();

        let db2 = reopen(&dir);
        let doc2 = db2.get_document("doc1").unwrap();
        let blob = doc2.get_blob("data").unwrap();
        assert_eq!(blob.content_type().as_deref(), Some("text/plain"));
        assert_eq!(blob.length(), 5);
        assert!(blob.digest().is_some());
        assert_eq!(blob.content().unwrap(), b"12345");

        let mut stream = blob.content_stream().unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_blob_cannot_migrate_databases() {
        let (_dir_a, db_a) = setup();
        let (_dir_b, db_b) = setup();

        let doc_a = db_a.get_document("doc1").unwrap();
        let blob = Blob::from_bytes("text/plain", "content");
        doc_a.set("data", blob.clone()).unwrap();
        doc_a.save().unwrap();

        let doc_b = db_b.get_document("doc1").unwrap();
        doc_b.set("data", blob).unwrap();
        assert!(matches!(
            doc_b.save(),
            Err(DocumentError::InvalidState(_))
        ));
    }

    #[test]
    fn test_batch_notification() {
        let (_dir, db) = setup();
        let events: Arc<Mutex<Vec<DatabaseChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        db.add_change_listener(move |change| sink.lock().push(change.clone()));

        db.in_batch(|| {
            for _ in 0..10 {
                let doc = db.create_document().unwrap();
                doc.set("type", "bulk").unwrap();
                doc.save().unwrap();
            }
            Ok(())
        })
        .unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].doc_ids.len(), 10);
        assert!(!events[0].external);
        assert_eq!(events[0].last_sequence, 10);
    }

    #[test]
    fn test_external_change_notification() {
        let (dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        doc.set("name", "local").unwrap();
        doc.save().unwrap();

        let events: Arc<Mutex<Vec<DatabaseChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        db.add_change_listener(move |change| sink.lock().push(change.clone()));
        let reloads: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let reload_sink = reloads.clone();
        doc.on_saved(move |_, external| reload_sink.lock().push(external));

        let db2 = reopen(&dir);
        let other = db2.get_document("doc1").unwrap();
        other.set("name", "external").unwrap();
        other.save().unwrap();

        db.poll_changes().unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].external);
        assert_eq!(events[0].doc_ids, vec!["doc1".to_string()]);
        // the live document reloaded to the external revision
        assert_eq!(doc.get_string("name").as_deref(), Some("external"));
        assert_eq!(*reloads.lock(), vec![true]);
    }

    #[test]
    fn test_documents_with_changes_ignore_external_reload() {
        let (dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        doc.set("name", "local").unwrap();
        doc.save().unwrap();

        doc.set("name", "pending").unwrap();

        let other = reopen(&dir).get_document("doc1").unwrap();
        other.set("name", "external").unwrap();
        other.save().unwrap();

        db.poll_changes().unwrap();
        // conflict handling is deferred to the next save
        assert_eq!(doc.get_string("name").as_deref(), Some("pending"));
        assert!(doc.has_changes());
    }

    #[test]
    fn test_rollback_on_batch_error() {
        let (_dir, db) = setup();
        let result: DatabaseResult<()> = db.in_batch(|| {
            let doc = db.get_document("doomed").unwrap();
            doc.set("x", 1i64).unwrap();
            doc.save().unwrap();
            Err(DatabaseError::InvalidConfig("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(db.get_existing_document("doomed").unwrap().is_none());
    }

    #[test]
    fn test_close_reports_unsaved() {
        let (_dir, db) = setup();
        let doc = db.get_document("doc1").unwrap();
        doc.set("x", 1i64).unwrap();

        let unsaved = db.close().unwrap();
        assert_eq!(unsaved, vec!["doc1".to_string()]);
        assert!(!db.is_open());
        assert!(matches!(
            db.get_document("doc1"),
            Err(DatabaseError::Closed)
        ));
        assert!(matches!(doc.save(), Err(DocumentError::InvalidState(_))));
    }

    #[test]
    fn test_indexes() {
        let (_dir, db) = setup();
        db.create_index("by_name", vec!["name".to_string()], IndexType::Value)
            .unwrap();
        db.create_index(
            "by_text",
            vec!["body".to_string()],
            IndexType::FullText,
        )
        .unwrap();

        let mut names = db.index_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["by_name".to_string(), "by_text".to_string()]);

        assert!(db.delete_index("by_name").unwrap());
        assert!(!db.delete_index("by_name").unwrap());
        assert_eq!(db.index_names().unwrap(), vec!["by_text".to_string()]);
    }

    #[test]
    fn test_create_document_generates_ids() {
        let (_dir, db) = setup();
        let a = db.create_document().unwrap();
        let b = db.create_document().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 26);
    }

    #[test]
    fn test_read_only_database_rejects_writes() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
            let doc = db.get_document("doc1").unwrap();
            doc.set("x", 1i64).unwrap();
            doc.save().unwrap();
        }

        let db = Database::open(DatabaseConfig::new(dir.path()).read_only(true)).unwrap();
        let doc = db.get_document("doc1").unwrap();
        assert_eq!(doc.get_long("x"), 1);
        doc.set("x", 2i64).unwrap();
        assert!(matches!(
            doc.save(),
            Err(DocumentError::Storage(StorageError::ReadOnly))
        ));
    }
}
