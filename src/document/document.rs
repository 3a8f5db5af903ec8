//! Documents.
//!
//! A document is the top-level property container bound to a persistent
//! record: a stable id plus the stored revision handle (revision id,
//! sequence, flags). Saving serializes the staged properties, submits them
//! as a new revision on top of the last known one, and on conflict re-reads
//! the persisted state, merges, and retries exactly once.

use std::sync::{Arc, Weak};

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use tracing::debug;

use crate::db::Database;
use crate::document::blob::Blob;
use crate::document::errors::{DocumentError, DocumentResult};
use crate::document::properties::{ContainerInner, ContainerRef};
use crate::document::subdocument::Subdocument;
use crate::document::value::{
    decode_dict_plain, encode_map, map_content_eq, map_to_plain, PropertyMap, Value,
};
use crate::pack::PackedBody;
use crate::storage::{DocId, PutOutcome, PutRequest, RawDocument, RevId};

/// Resolves a save conflict.
///
/// `mine` is the in-memory state being saved, `theirs` the currently
/// persisted state, `base` the persisted state the mutations started from.
/// Returning None gives up and surfaces the conflict.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        mine: &PropertyMap,
        theirs: &PropertyMap,
        base: &PropertyMap,
    ) -> Option<PropertyMap>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&PropertyMap, &PropertyMap, &PropertyMap) -> Option<PropertyMap> + Send + Sync,
{
    fn resolve(
        &self,
        mine: &PropertyMap,
        theirs: &PropertyMap,
        base: &PropertyMap,
    ) -> Option<PropertyMap> {
        self(mine, theirs, base)
    }
}

/// handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(pub(crate) u64);

type MutationListener = Arc<dyn Fn(&Document) + Send + Sync>;
type SavedListener = Arc<dyn Fn(&Document, bool) + Send + Sync>;

/// the stored-revision handle a document is bound to
#[derive(Debug, Clone)]
struct StoredRevision {
    rev_id: RevId,
    sequence: u64,
    deleted: bool,
    has_attachments: bool,
}

#[derive(Default)]
struct DocState {
    record: Option<StoredRevision>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    next_token: u64,
    mutation_listeners: Vec<(u64, MutationListener)>,
    saved_listeners: Vec<(u64, SavedListener)>,
}

pub(crate) struct DocInner {
    id: DocId,
    db: Database,
    container: ContainerRef,
    state: Mutex<DocState>,
}

/// A document.
///
/// Clone this to share it - clones refer to the same instance.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocInner>,
}

impl Document {
    /// Bind a new document handle, optionally onto a stored record.
    pub(crate) fn from_parts(
        db: Database,
        id: DocId,
        raw: Option<RawDocument>,
    ) -> DocumentResult<Document> {
        let container = ContainerInner::new_detached();
        let inner = Arc::new(DocInner {
            id,
            db: db.clone(),
            container,
            state: Mutex::new(DocState::default()),
        });
        {
            let weak: Weak<DocInner> = Arc::downgrade(&inner);
            let mut store = inner.container.store.lock();
            store.shared_keys = Some(db.shared_keys());
            store.database = Some(db);
            store.owner = Some(weak.clone());
            store.on_change = Some(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Document { inner }.on_mutated();
                }
            }));
        }
        let doc = Document { inner };
        if let Some(raw) = raw {
            doc.bind_raw(raw)?;
        }
        Ok(doc)
    }

    pub(crate) fn from_inner(inner: Arc<DocInner>) -> Document {
        Document { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<DocInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> &str {
        self.inner.id.as_str()
    }

    pub(crate) fn doc_id(&self) -> &DocId {
        &self.inner.id
    }

    pub fn database(&self) -> Database {
        self.inner.db.clone()
    }

    /// whether the document has ever been saved
    pub fn exists(&self) -> bool {
        self.inner.state.lock().record.is_some()
    }

    /// whether the current persisted revision is a deletion
    pub fn is_deleted(&self) -> bool {
        self.inner
            .state
            .lock()
            .record
            .as_ref()
            .map(|r| r.deleted)
            .unwrap_or(false)
    }

    /// sequence of the bound revision; 0 when unsaved
    pub fn sequence(&self) -> u64 {
        self.inner
            .state
            .lock()
            .record
            .as_ref()
            .map(|r| r.sequence)
            .unwrap_or(0)
    }

    /// revision id of the bound revision
    pub fn revision_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .record
            .as_ref()
            .map(|r| r.rev_id.to_string())
    }

    pub fn has_changes(&self) -> bool {
        self.inner.container.has_changes()
    }

    /// install a per-document conflict resolver (None falls back to the
    /// database default, then to the generation tiebreak)
    pub fn set_conflict_resolver(&self, resolver: Option<Arc<dyn ConflictResolver>>) {
        self.inner.state.lock().resolver = resolver;
    }

    // ==================== Property access ====================

    pub fn get(&self, key: &str) -> Value {
        self.inner.container.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.container.contains(key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.inner.container.get_bool(key)
    }

    pub fn get_long(&self, key: &str) -> i64 {
        self.inner.container.get_long(key)
    }

    pub fn get_double(&self, key: &str) -> f64 {
        self.inner.container.get_double(key)
    }

    pub fn get_float(&self, key: &str) -> f32 {
        self.inner.container.get_float(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.inner.container.get_string(key)
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        self.inner.container.get_date(key)
    }

    pub fn get_blob(&self, key: &str) -> Option<Blob> {
        self.inner.container.get_blob(key)
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<Value>> {
        self.inner.container.get_array(key)
    }

    pub fn get_subdocument(&self, key: &str) -> Option<Subdocument> {
        self.inner.container.get_subdocument(key)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> DocumentResult<()> {
        self.inner.container.set(key, value.into())
    }

    pub fn remove(&self, key: &str) -> DocumentResult<()> {
        self.inner.container.remove(key)
    }

    pub fn properties(&self) -> PropertyMap {
        self.inner.container.properties()
    }

    pub fn replace_properties(&self, new: Option<PropertyMap>) -> DocumentResult<()> {
        self.inner.container.replace_properties(new)
    }

    /// drop all staged changes, restoring the persisted state
    pub fn revert(&self) {
        self.inner.container.revert();
        self.inner.db.clear_unsaved(self.id());
    }

    // ==================== Events ====================

    /// fires on every key mutation, anywhere in the property tree
    pub fn on_mutation(&self, listener: impl Fn(&Document) + Send + Sync + 'static) -> ListenerToken {
        let mut state = self.inner.state.lock();
        state.next_token += 1;
        let token = ListenerToken(state.next_token);
        state.mutation_listeners.push((token.0, Arc::new(listener)));
        token
    }

    /// fires after each successful save; the flag marks external changes
    pub fn on_saved(
        &self,
        listener: impl Fn(&Document, bool) + Send + Sync + 'static,
    ) -> ListenerToken {
        let mut state = self.inner.state.lock();
        state.next_token += 1;
        let token = ListenerToken(state.next_token);
        state.saved_listeners.push((token.0, Arc::new(listener)));
        token
    }

    pub fn remove_listener(&self, token: ListenerToken) {
        let mut state = self.inner.state.lock();
        state.mutation_listeners.retain(|(t, _)| *t != token.0);
        state.saved_listeners.retain(|(t, _)| *t != token.0);
    }

    fn on_mutated(&self) {
        self.inner.db.note_unsaved(self);
        let listeners: Vec<MutationListener> = {
            let state = self.inner.state.lock();
            state
                .mutation_listeners
                .iter()
                .map(|(_, l)| l.clone())
                .collect()
        };
        for listener in listeners {
            listener(self);
        }
    }

    fn fire_saved(&self, external: bool) {
        let listeners: Vec<SavedListener> = {
            let state = self.inner.state.lock();
            state.saved_listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(self, external);
        }
    }

    // ==================== Persistence ====================

    /// Save staged changes as a new revision.
    ///
    /// A conflicting concurrent write triggers one merge (resolver or
    /// generation tiebreak) and one retry; a second conflict surfaces.
    pub fn save(&self) -> DocumentResult<()> {
        self.save_internal(false)
    }

    /// Save a deletion revision. The record remains (`exists()` stays
    /// true); the properties become empty.
    pub fn delete(&self) -> DocumentResult<()> {
        if !self.exists() {
            return Err(DocumentError::NotFound);
        }
        self.save_internal(true)
    }

    fn save_internal(&self, deletion: bool) -> DocumentResult<()> {
        if !self.has_changes() && !deletion && self.exists() {
            return Ok(());
        }

        let mut outcome: Option<(RevId, u64, Vec<u8>, bool)> = None;
        let mut ended_early = false;
        self.inner.db.with_write_txn(|| {
            match self.try_put(deletion)? {
                Some(result) => outcome = Some(result),
                None => {
                    debug!(id = %self.inner.id, "save conflict, merging");
                    self.merge(deletion)?;
                    if !self.has_changes() {
                        ended_early = true;
                        return Ok(());
                    }
                    match self.try_put(deletion)? {
                        Some(result) => outcome = Some(result),
                        None => return Err(DocumentError::Conflict),
                    }
                }
            }
            Ok(())
        })?;
        if ended_early {
            self.inner.db.clear_unsaved(self.id());
            return Ok(());
        }

        let (rev_id, sequence, body, has_attachments) = outcome.expect("set on success");
        let root = if body.is_empty() {
            None
        } else {
            Some(PackedBody::new(body, self.inner.db.shared_keys()).root()?)
        };
        {
            let mut state = self.inner.state.lock();
            state.record = Some(StoredRevision {
                rev_id,
                sequence,
                deleted: deletion,
                has_attachments,
            });
        }
        self.inner.container.use_new_root(root);
        if deletion {
            self.inner.container.replace_properties(None)?;
        }
        self.inner.container.clear_changes_recursive();
        self.inner.db.clear_unsaved(self.id());
        self.fire_saved(false);
        Ok(())
    }

    /// one put attempt; None means the storage layer saw a newer revision
    fn try_put(&self, deletion: bool) -> DocumentResult<Option<(RevId, u64, Vec<u8>, bool)>> {
        let (body, has_attachments) = if deletion {
            (Vec::new(), false)
        } else {
            self.encode_body()?
        };
        let history: Vec<RevId> = {
            let state = self.inner.state.lock();
            state.record.iter().map(|r| r.rev_id.clone()).collect()
        };
        let request = PutRequest {
            id: self.inner.id.clone(),
            body: body.clone(),
            history,
            deleted: deletion,
            has_attachments,
        };
        match self.inner.db.store().put(request)? {
            PutOutcome::Committed { rev_id, sequence } => {
                Ok(Some((rev_id, sequence, body, has_attachments)))
            }
            PutOutcome::Conflict => Ok(None),
        }
    }

    /// serialize the effective properties; installs any pending blobs
    fn encode_body(&self) -> DocumentResult<(Vec<u8>, bool)> {
        let map = self.inner.container.properties();
        let mut blob_count = 0usize;
        for value in map.values() {
            install_value_blobs(value, &self.inner.db, &mut blob_count)?;
        }
        let keys = self.inner.db.shared_keys();
        let mut body = Vec::new();
        encode_map(&map, &keys, &mut body)?;
        self.inner.db.persist_shared_keys()?;
        Ok((body, blob_count > 0))
    }

    /// Conflict merge.
    ///
    /// Rebinds the document to the persisted revision and replaces the
    /// properties with the resolution. When the resolution equals the
    /// persisted state, the change set clears and the outer save loop ends
    /// without writing.
    fn merge(&self, deletion: bool) -> DocumentResult<()> {
        let their_raw = self
            .inner
            .db
            .store()
            .get_document(&self.inner.id)?
            .ok_or(DocumentError::Conflict)?;

        let theirs: PropertyMap = if their_raw.flags.deleted || their_raw.body.is_empty() {
            PropertyMap::new()
        } else {
            let body = PackedBody::new(their_raw.body.clone(), self.inner.db.shared_keys());
            decode_dict_plain(&body.root()?, &Some(self.inner.db.clone()))?
        };
        // a deep plain snapshot: rebinding to theirs below reshapes the live
        // containers, so the resolution must not share them
        let mine = map_to_plain(&self.inner.container.properties());
        let base = self.inner.container.root_snapshot();

        let my_generation = {
            let state = self.inner.state.lock();
            state.record.as_ref().map(|r| r.rev_id.generation()).unwrap_or(0) + 1
        };
        let their_generation = their_raw.rev_id.generation();

        let resolver = {
            let state = self.inner.state.lock();
            state.resolver.clone()
        }
        .or_else(|| self.inner.db.default_resolver());

        let resolved: PropertyMap = if deletion {
            theirs.clone()
        } else if let Some(resolver) = resolver {
            resolver
                .resolve(&mine, &theirs, &base)
                .ok_or(DocumentError::Conflict)?
        } else if my_generation >= their_generation {
            // mine is deeper wins; ties favor mine
            mine
        } else {
            theirs.clone()
        };

        self.bind_raw(their_raw)?;
        self.inner.container.clear_changes_recursive();

        if map_content_eq(&resolved, &theirs) {
            // nothing left to write
            return Ok(());
        }
        self.inner
            .container
            .replace_properties(if resolved.is_empty() {
                None
            } else {
                Some(resolved)
            })
    }

    /// Remove the document and every revision from the store.
    ///
    /// Returns whether anything was purged. Afterwards the document reads
    /// as never saved.
    pub fn purge(&self) -> DocumentResult<bool> {
        if !self.exists() {
            return Ok(false);
        }
        let mut purged = false;
        self.inner.db.with_write_txn(|| {
            purged = self.inner.db.store().purge_document(&self.inner.id)?;
            Ok(())
        })?;
        self.inner.state.lock().record = None;
        self.inner.container.use_new_root(None);
        self.inner.container.discard_state();
        self.inner.db.clear_unsaved(self.id());
        Ok(purged)
    }

    /// React to an external change: reload when there are no pending
    /// mutations, otherwise defer to conflict handling at the next save.
    pub(crate) fn changed_externally(&self) -> DocumentResult<()> {
        if self.has_changes() {
            return Ok(());
        }
        match self.inner.db.store().get_document(&self.inner.id)? {
            Some(raw) => self.bind_raw(raw)?,
            None => {
                self.inner.state.lock().record = None;
                self.inner.container.use_new_root(None);
                self.inner.container.discard_state();
            }
        }
        self.fire_saved(true);
        Ok(())
    }

    /// bind a stored record: adopt its revision handle and encoded root
    fn bind_raw(&self, raw: RawDocument) -> DocumentResult<()> {
        let root = if raw.body.is_empty() {
            None
        } else {
            Some(PackedBody::new(raw.body, self.inner.db.shared_keys()).root()?)
        };
        {
            let mut state = self.inner.state.lock();
            state.record = Some(StoredRevision {
                rev_id: raw.rev_id,
                sequence: raw.sequence,
                deleted: raw.flags.deleted,
                has_attachments: raw.flags.has_attachments,
            });
        }
        self.inner.container.use_new_root(root);
        Ok(())
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id())
            .field("exists", &self.exists())
            .field("is_deleted", &self.is_deleted())
            .field("has_changes", &self.has_changes())
            .finish()
    }
}

/// install every blob reachable from a value into the database
fn install_value_blobs(value: &Value, db: &Database, count: &mut usize) -> DocumentResult<()> {
    match value {
        Value::Blob(blob) => {
            blob.install(db)?;
            *count += 1;
        }
        Value::Subdoc(sd) => {
            for nested in sd.properties().values() {
                install_value_blobs(nested, db, count)?;
            }
        }
        Value::Dict(map) => {
            for nested in map.values() {
                install_value_blobs(nested, db, count)?;
            }
        }
        Value::Array(items) => {
            for nested in items {
                install_value_blobs(nested, db, count)?;
            }
        }
        _ => {}
    }
    Ok(())
}
