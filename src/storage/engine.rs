//! The revision store.
//!
//! This is the central component of the storage layer. It wraps a bare
//! `git2::Repository` with thread-safe access: document records live in a
//! `docs/` tree, revision bodies and attachments are content-addressed blobs
//! in the object database, and every committed transaction is one commit on
//! the main ref, advanced by compare-and-swap.
//!
//! Writes require an open transaction. `put` checks the caller's parent
//! revision against the stored record and reports a conflict instead of
//! clobbering; the caller decides how to merge and retries.
//!
//! A second handle on the same path (or another process) shows up as the
//! main ref moving without our involvement. That is detected whenever the
//! handle is used outside a transaction, and the affected documents are fed
//! to observers with the external flag set.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use git2::{ObjectType, Oid, Repository};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::errors::{StorageError, StorageResult};
use crate::storage::record::{deserialize_record, serialize_record, DocRecord};
use crate::storage::refs::RefManager;
use crate::storage::tree::{Snapshot, TreeEditor, DOCS_DIR};
use crate::storage::types::{
    ChangeEntry, CommitId, DocId, DocumentFlags, RawDocument, RevId, StoreOptions, StoreSignature,
    Versioning,
};

/// metadata file carrying the sequence counter
pub(crate) const INFO_META: &str = "info";
/// metadata file carrying the shared key table
pub const SHARED_KEYS_META: &str = "shared_keys";
/// metadata file carrying persisted index definitions
pub const INDEXES_META: &str = "indexes";

/// bounded retry schedule for transient lock contention in libgit2
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);
const RETRY_ATTEMPTS: u32 = 5;

#[derive(Serialize, Deserialize, Default)]
struct StoreInfo {
    last_sequence: u64,
}

/// a write request for one document
#[derive(Debug)]
pub struct PutRequest {
    pub id: DocId,
    pub body: Vec<u8>,
    /// expected parent revision, newest first; empty for a first write
    pub history: Vec<RevId>,
    pub deleted: bool,
    pub has_attachments: bool,
}

/// result of a `put`
#[derive(Debug)]
pub enum PutOutcome {
    Committed { rev_id: RevId, sequence: u64 },
    /// the stored record's revision does not match the request's parent
    Conflict,
}

/// The revision store handle.
///
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct RevStore {
    pub(crate) inner: Arc<RevStoreInner>,
}

pub(crate) struct RevStoreInner {
    pub(crate) core: Mutex<EngineCore>,
    path: PathBuf,
    read_only: bool,
    signature: StoreSignature,
}

pub(crate) struct EngineCore {
    pub(crate) repo: Repository,
    head: CommitId,
    last_sequence: u64,
    txn: Option<TxnState>,
    observers: Vec<Weak<ObserverInner>>,
    /// observers with fresh queue entries, called back once the lock drops
    pending_notify: Vec<Arc<ObserverInner>>,
}

struct TxnState {
    base: CommitId,
    next_sequence: u64,
    /// doc id -> record blob OID; None marks a purge
    staged: BTreeMap<DocId, Option<Oid>>,
    staged_meta: BTreeMap<String, Oid>,
    changes: Vec<ChangeEntry>,
}

impl RevStore {
    /// Open a store, creating it when allowed by the options.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> StorageResult<Self> {
        if options.encryption_key.is_some() {
            return Err(StorageError::EncryptionUnsupported);
        }
        match options.versioning {
            Versioning::RevisionTrees => {}
        }

        let path = path.as_ref();
        let initialized = path.join("HEAD").exists();

        let repo = if initialized {
            Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?
        } else {
            if !options.create {
                return Err(StorageError::NotInitialized(path.to_path_buf()));
            }
            if options.read_only {
                return Err(StorageError::ReadOnly);
            }
            std::fs::create_dir_all(path)?;
            let repo = Repository::init_bare(path)?;
            let initial = {
                let info = serde_json::to_vec(&StoreInfo::default())?;
                let info_oid = repo.blob(&info)?;
                let mut editor = TreeEditor::empty(&repo)?;
                editor.put_meta(INFO_META, info_oid)?;
                let tree_oid = editor.write()?;
                let tree = repo.find_tree(tree_oid)?;
                let sig = StoreSignature::vellum().to_git2_signature()?;
                CommitId::new(repo.commit(None, &sig, &sig, "initialize store", &tree, &[])?)
            };
            RefManager::init(&repo, initial)?;
            debug!(path = %path.display(), "initialized new store");
            repo
        };

        let head = RefManager::head(&repo)?;
        let last_sequence = {
            let commit = repo.find_commit(head.raw())?;
            let snapshot = Snapshot::new(commit.tree()?);
            read_info(&repo, &snapshot)?.last_sequence
        };

        Ok(Self {
            inner: Arc::new(RevStoreInner {
                core: Mutex::new(EngineCore {
                    repo,
                    head,
                    last_sequence,
                    txn: None,
                    observers: Vec::new(),
                    pending_notify: Vec::new(),
                }),
                path: path.to_path_buf(),
                read_only: options.read_only,
                signature: StoreSignature::vellum(),
            }),
        })
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Remove a store from disk. The path must not be in use.
    pub fn delete_at_path(path: impl AsRef<Path>) -> StorageResult<()> {
        std::fs::remove_dir_all(path.as_ref())?;
        Ok(())
    }

    /// Run `f` under the engine lock, then fire any observer callbacks the
    /// call queued. Callbacks run without the lock so subscribers may call
    /// back into the store.
    fn with_core<T>(&self, f: impl FnOnce(&mut EngineCore) -> StorageResult<T>) -> StorageResult<T> {
        let (result, notify) = {
            let mut core = self.inner.core.lock();
            let result = f(&mut core);
            let notify = std::mem::take(&mut core.pending_notify);
            (result, notify)
        };
        for observer in notify {
            (observer.callback)();
        }
        result
    }

    // ==================== Transactions ====================

    /// Begin a transaction. Only one may be open per handle.
    pub fn begin_transaction(&self) -> StorageResult<()> {
        if self.inner.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.with_core(|core| {
            if core.txn.is_some() {
                return Err(StorageError::TransactionActive);
            }
            core.refresh_external()?;
            core.txn = Some(TxnState {
                base: core.head,
                next_sequence: core.last_sequence,
                staged: BTreeMap::new(),
                staged_meta: BTreeMap::new(),
                changes: Vec::new(),
            });
            Ok(())
        })
    }

    /// Whether this handle has an open transaction.
    pub fn is_in_transaction(&self) -> bool {
        self.inner.core.lock().txn.is_some()
    }

    /// Commit or roll back the open transaction.
    ///
    /// On commit the staged records become one commit parented on the
    /// transaction's base snapshot, and main is advanced by compare-and-swap.
    pub fn end_transaction(&self, commit: bool) -> StorageResult<()> {
        self.with_core(|core| {
            let txn = core.txn.take().ok_or(StorageError::TransactionRequired)?;
            if !commit {
                debug!("transaction rolled back");
                return Ok(());
            }
            if txn.staged.is_empty() && txn.staged_meta.is_empty() {
                return Ok(());
            }

            let new_head = {
                let repo = &core.repo;
                let base_commit = repo.find_commit(txn.base.raw())?;
                let snapshot = Snapshot::new(base_commit.tree()?);
                let mut editor = TreeEditor::from_snapshot(repo, &snapshot)?;
                for (id, staged) in &txn.staged {
                    match staged {
                        Some(record_oid) => editor.put_record(id, *record_oid)?,
                        None => editor.remove_record(id)?,
                    }
                }
                let info = serde_json::to_vec(&StoreInfo {
                    last_sequence: txn.next_sequence,
                })?;
                let info_oid = repo.blob(&info)?;
                editor.put_meta(INFO_META, info_oid)?;
                for (name, oid) in &txn.staged_meta {
                    editor.put_meta(name, *oid)?;
                }
                let tree_oid = editor.write()?;
                let tree = repo.find_tree(tree_oid)?;

                let sig = self.inner.signature.to_git2_signature()?;
                let message = format!(
                    "commit {} document(s) at seq {}",
                    txn.staged.len(),
                    txn.next_sequence
                );
                let commit_oid =
                    repo.commit(None, &sig, &sig, &message, &tree, &[&base_commit])?;
                let new_head = CommitId::new(commit_oid);
                with_retry(|| RefManager::advance(repo, txn.base, new_head))?;
                new_head
            };

            debug!(head = %new_head.short(), seq = txn.next_sequence, "transaction committed");
            core.head = new_head;
            core.last_sequence = txn.next_sequence;
            core.deliver(txn.changes, false);
            Ok(())
        })
    }

    // ==================== Documents ====================

    /// Read a document record and its body.
    pub fn get_document(&self, id: &DocId) -> StorageResult<Option<RawDocument>> {
        self.with_core(|core| {
            if core.txn.is_none() {
                core.refresh_external()?;
            }
            let record = match core.current_record(id)? {
                Some(r) => r,
                None => return Ok(None),
            };
            let body = match record.body_oid {
                Some(oid) => read_blob(&core.repo, oid)?,
                None => Vec::new(),
            };
            Ok(Some(RawDocument {
                id: id.clone(),
                rev_id: record.rev_id,
                sequence: record.sequence,
                flags: DocumentFlags {
                    exists: true,
                    deleted: record.deleted,
                    has_attachments: record.has_attachments,
                },
                body,
            }))
        })
    }

    /// Write a new revision of a document.
    ///
    /// The request's parent revision must match the stored record (or both
    /// must be absent); otherwise `PutOutcome::Conflict` comes back and
    /// nothing is staged.
    pub fn put(&self, req: PutRequest) -> StorageResult<PutOutcome> {
        self.with_core(|core| {
            if core.txn.is_none() {
                return Err(StorageError::TransactionRequired);
            }
            let current = core.current_record(&req.id)?;

            let parent = req.history.first();
            let parent_matches = match (&current, parent) {
                (Some(cur), Some(p)) => cur.rev_id == *p,
                (None, None) => true,
                // a tombstone may be overwritten without naming it
                (Some(cur), None) => cur.deleted,
                (None, Some(_)) => false,
            };
            if !parent_matches {
                debug!(id = %req.id, "put conflict: stored revision moved");
                return Ok(PutOutcome::Conflict);
            }

            let digest = Oid::hash_object(ObjectType::Blob, &req.body)?.to_string();
            let rev_id = RevId::next(current.as_ref().map(|c| &c.rev_id), &digest);
            let body_oid = if req.body.is_empty() {
                None
            } else {
                Some(core.repo.blob(&req.body)?)
            };

            let sequence = {
                let txn = core.txn.as_mut().expect("checked above");
                txn.next_sequence += 1;
                txn.next_sequence
            };
            let record = DocRecord {
                id: req.id.clone(),
                rev_id: rev_id.clone(),
                sequence,
                deleted: req.deleted,
                has_attachments: req.has_attachments,
                body_oid,
            };
            let record_oid = core.repo.blob(&serialize_record(&record)?)?;

            let txn = core.txn.as_mut().expect("checked above");
            txn.staged.insert(req.id.clone(), Some(record_oid));
            txn.changes.push(ChangeEntry {
                doc_id: req.id,
                rev_id: rev_id.clone(),
                sequence,
            });
            Ok(PutOutcome::Committed { rev_id, sequence })
        })
    }

    /// Remove a document record and all its revisions.
    ///
    /// Returns whether anything was there to purge. Purges produce no change
    /// feed entries; they are local, not revisions.
    pub fn purge_document(&self, id: &DocId) -> StorageResult<bool> {
        self.with_core(|core| {
            if core.txn.is_none() {
                return Err(StorageError::TransactionRequired);
            }
            if core.current_record(id)?.is_none() {
                return Ok(false);
            }
            let txn = core.txn.as_mut().expect("checked above");
            txn.staged.insert(id.clone(), None);
            Ok(true)
        })
    }

    // ==================== Metadata ====================

    /// Read a metadata file from the current snapshot.
    pub fn read_meta(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        self.with_core(|core| {
            if let Some(txn) = &core.txn {
                if let Some(oid) = txn.staged_meta.get(name) {
                    return read_blob(&core.repo, *oid).map(Some);
                }
            } else {
                core.refresh_external()?;
            }
            let at = core.txn.as_ref().map(|t| t.base).unwrap_or(core.head);
            let commit = core.repo.find_commit(at.raw())?;
            let snapshot = Snapshot::new(commit.tree()?);
            match snapshot.meta_oid(&core.repo, name)? {
                Some(oid) => read_blob(&core.repo, oid).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Stage a metadata file into the open transaction.
    pub fn put_meta(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        self.with_core(|core| {
            if core.txn.is_none() {
                return Err(StorageError::TransactionRequired);
            }
            let oid = core.repo.blob(bytes)?;
            let txn = core.txn.as_mut().expect("checked above");
            txn.staged_meta.insert(name.to_string(), oid);
            Ok(())
        })
    }

    /// The highest sequence number the store has handed out.
    pub fn last_sequence(&self) -> StorageResult<u64> {
        self.with_core(|core| {
            if core.txn.is_none() {
                core.refresh_external()?;
            }
            Ok(core.last_sequence)
        })
    }

    // ==================== Observers ====================

    /// Register a change observer.
    ///
    /// The callback fires (outside the engine lock) whenever new entries are
    /// queued; pull them with `ChangeObserver::get_changes`.
    pub fn observe(&self, callback: impl Fn() + Send + Sync + 'static) -> ChangeObserver {
        let observer = Arc::new(ObserverInner {
            queue: Mutex::new(VecDeque::new()),
            callback: Box::new(callback),
        });
        self.inner
            .core
            .lock()
            .observers
            .push(Arc::downgrade(&observer));
        ChangeObserver { inner: observer }
    }

    /// Check for external head movement now (no-op inside a transaction).
    pub fn poll_external(&self) -> StorageResult<()> {
        self.with_core(|core| {
            if core.txn.is_none() {
                core.refresh_external()?;
            }
            Ok(())
        })
    }
}

impl EngineCore {
    /// record for a doc id, staged overlay first, then the base snapshot
    fn current_record(&self, id: &DocId) -> StorageResult<Option<DocRecord>> {
        if let Some(txn) = &self.txn {
            if let Some(staged) = txn.staged.get(id) {
                return match staged {
                    Some(record_oid) => {
                        let bytes = read_blob(&self.repo, *record_oid)?;
                        deserialize_record(&bytes, id).map(Some)
                    }
                    None => Ok(None),
                };
            }
        }
        let at = self.txn.as_ref().map(|t| t.base).unwrap_or(self.head);
        let commit = self.repo.find_commit(at.raw())?;
        let snapshot = Snapshot::new(commit.tree()?);
        match snapshot.record_oid(&self.repo, id)? {
            Some(record_oid) => {
                let bytes = read_blob(&self.repo, record_oid)?;
                deserialize_record(&bytes, id).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Detect main moving underneath us (another handle or process).
    ///
    /// Diffs the `docs/` tree between the old and new heads and queues one
    /// external change entry per affected document. Must not run while a
    /// transaction is open; the base snapshot pins the view instead.
    fn refresh_external(&mut self) -> StorageResult<()> {
        debug_assert!(self.txn.is_none());
        let new_head = RefManager::head(&self.repo)?;
        if new_head == self.head {
            return Ok(());
        }
        debug!(from = %self.head.short(), to = %new_head.short(), "external head movement");

        let mut entries = Vec::new();
        let last_sequence;
        {
            let repo = &self.repo;
            let old_tree = repo.find_commit(self.head.raw())?.tree()?;
            let new_commit = repo.find_commit(new_head.raw())?;
            let new_tree = new_commit.tree()?;
            let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;
            let snapshot = Snapshot::new(new_commit.tree()?);

            for delta in diff.deltas() {
                let path = match delta.new_file().path().or_else(|| delta.old_file().path()) {
                    Some(p) => p,
                    None => continue,
                };
                let name = match path.strip_prefix(DOCS_DIR).ok().and_then(|p| p.to_str()) {
                    Some(n) if !n.is_empty() => n,
                    _ => continue,
                };
                let id = match DocId::new(name) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(entry = name, error = %e, "ignoring undecodable docs entry");
                        continue;
                    }
                };
                // a removed record file is a purge elsewhere; no entry for those
                if let Some(record_oid) = snapshot.record_oid(repo, &id)? {
                    let record = deserialize_record(&read_blob(repo, record_oid)?, &id)?;
                    entries.push(ChangeEntry {
                        doc_id: id,
                        rev_id: record.rev_id,
                        sequence: record.sequence,
                    });
                }
            }
            last_sequence = read_info(repo, &snapshot)?.last_sequence;
        }

        self.head = new_head;
        self.last_sequence = last_sequence;
        self.deliver(entries, true);
        Ok(())
    }

    /// queue entries for every live observer and schedule its callback
    fn deliver(&mut self, entries: Vec<ChangeEntry>, external: bool) {
        if entries.is_empty() {
            return;
        }
        self.observers.retain(|weak| weak.strong_count() > 0);
        for weak in &self.observers {
            if let Some(observer) = weak.upgrade() {
                {
                    let mut queue = observer.queue.lock();
                    queue.extend(entries.iter().cloned().map(|e| (e, external)));
                }
                if !self
                    .pending_notify
                    .iter()
                    .any(|o| Arc::ptr_eq(o, &observer))
                {
                    self.pending_notify.push(observer);
                }
            }
        }
    }
}

/// A registered change observer; dropped observers unregister themselves.
pub struct ChangeObserver {
    inner: Arc<ObserverInner>,
}

pub(crate) struct ObserverInner {
    queue: Mutex<VecDeque<(ChangeEntry, bool)>>,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl ChangeObserver {
    /// Pull up to `max` queued entries sharing one external flag.
    ///
    /// Entries stop at a flip of the flag so a batch is always uniformly
    /// local or uniformly external.
    pub fn get_changes(&self, max: usize) -> (Vec<ChangeEntry>, bool) {
        let mut queue = self.inner.queue.lock();
        let external = match queue.front() {
            Some((_, e)) => *e,
            None => return (Vec::new(), false),
        };
        let mut out = Vec::new();
        while out.len() < max {
            match queue.front() {
                Some((_, e)) if *e == external => {
                    out.push(queue.pop_front().expect("front checked").0);
                }
                _ => break,
            }
        }
        (out, external)
    }
}

fn read_blob(repo: &Repository, oid: Oid) -> StorageResult<Vec<u8>> {
    let blob = repo
        .find_blob(oid)
        .map_err(|_| StorageError::BlobNotFound(oid.to_string()))?;
    Ok(blob.content().to_vec())
}

fn read_info(repo: &Repository, snapshot: &Snapshot<'_>) -> StorageResult<StoreInfo> {
    match snapshot.meta_oid(repo, INFO_META)? {
        Some(oid) => Ok(serde_json::from_slice(&read_blob(repo, oid)?)?),
        None => Ok(StoreInfo::default()),
    }
}

/// retry transient libgit2 lock contention with a bounded exponential schedule
fn with_retry<T>(mut f: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
    let mut delay = RETRY_BASE_DELAY;
    for _ in 0..RETRY_ATTEMPTS {
        match f() {
            Err(StorageError::Git(e)) if e.code() == git2::ErrorCode::Locked => {
                debug!("ref lock contention, retrying in {:?}", delay);
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RevStore) {
        let dir = TempDir::new().unwrap();
        let store = RevStore::open(
            dir.path(),
            StoreOptions {
                create: true,
                ..Default::default()
            },
        )
        .unwrap();
        (dir, store)
    }

    fn put_doc(store: &RevStore, id: &DocId, body: &[u8], history: Vec<RevId>) -> (RevId, u64) {
        match store
            .put(PutRequest {
                id: id.clone(),
                body: body.to_vec(),
                history,
                deleted: false,
                has_attachments: false,
            })
            .unwrap()
        {
            PutOutcome::Committed { rev_id, sequence } => (rev_id, sequence),
            PutOutcome::Conflict => panic!("unexpected conflict"),
        }
    }

    #[test]
    fn test_open_and_reopen() {
        let dir = TempDir::new().unwrap();
        let store = RevStore::open(
            dir.path(),
            StoreOptions {
                create: true,
                ..Default::default()
            },
        )
        .unwrap();
        drop(store);

        // reopening without create works once initialized
        let store = RevStore::open(dir.path(), StoreOptions::default()).unwrap();
        assert_eq!(store.last_sequence().unwrap(), 0);
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let result = RevStore::open(dir.path().join("nope"), StoreOptions::default());
        assert!(matches!(result, Err(StorageError::NotInitialized(_))));
    }

    #[test]
    fn test_encryption_key_rejected() {
        let dir = TempDir::new().unwrap();
        let result = RevStore::open(
            dir.path(),
            StoreOptions {
                create: true,
                encryption_key: Some(vec![0; 32]),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(StorageError::EncryptionUnsupported)));
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = setup();
        let id = DocId::new("doc1").unwrap();

        store.begin_transaction().unwrap();
        let (rev, seq) = put_doc(&store, &id, b"body-bytes", vec![]);
        assert_eq!(rev.generation(), 1);
        assert_eq!(seq, 1);

        // visible inside the transaction
        let raw = store.get_document(&id).unwrap().unwrap();
        assert_eq!(raw.body, b"body-bytes");
        store.end_transaction(true).unwrap();

        // and after commit
        let raw = store.get_document(&id).unwrap().unwrap();
        assert_eq!(raw.rev_id, rev);
        assert_eq!(raw.sequence, 1);
        assert!(raw.flags.exists);
        assert!(!raw.flags.deleted);
        assert_eq!(store.last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_put_requires_transaction() {
        let (_dir, store) = setup();
        let id = DocId::new("doc1").unwrap();
        let result = store.put(PutRequest {
            id,
            body: vec![],
            history: vec![],
            deleted: false,
            has_attachments: false,
        });
        assert!(matches!(result, Err(StorageError::TransactionRequired)));
    }

    #[test]
    fn test_put_conflict_on_stale_parent() {
        let (_dir, store) = setup();
        let id = DocId::new("doc1").unwrap();

        store.begin_transaction().unwrap();
        let (rev1, _) = put_doc(&store, &id, b"v1", vec![]);
        let (_rev2, _) = put_doc(&store, &id, b"v2", vec![rev1.clone()]);
        store.end_transaction(true).unwrap();

        // writing against the superseded revision conflicts
        store.begin_transaction().unwrap();
        let outcome = store
            .put(PutRequest {
                id: id.clone(),
                body: b"v3".to_vec(),
                history: vec![rev1],
                deleted: false,
                has_attachments: false,
            })
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Conflict));
        // a first-write against an existing doc conflicts too
        let outcome = store
            .put(PutRequest {
                id,
                body: b"v3".to_vec(),
                history: vec![],
                deleted: false,
                has_attachments: false,
            })
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Conflict));
        store.end_transaction(false).unwrap();
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (_dir, store) = setup();
        let id = DocId::new("doc1").unwrap();

        store.begin_transaction().unwrap();
        put_doc(&store, &id, b"body", vec![]);
        store.end_transaction(false).unwrap();

        assert!(store.get_document(&id).unwrap().is_none());
        assert_eq!(store.last_sequence().unwrap(), 0);
    }

    #[test]
    fn test_purge() {
        let (_dir, store) = setup();
        let id = DocId::new("doc1").unwrap();

        store.begin_transaction().unwrap();
        put_doc(&store, &id, b"body", vec![]);
        store.end_transaction(true).unwrap();

        store.begin_transaction().unwrap();
        assert!(store.purge_document(&id).unwrap());
        store.end_transaction(true).unwrap();

        assert!(store.get_document(&id).unwrap().is_none());

        store.begin_transaction().unwrap();
        assert!(!store.purge_document(&id).unwrap());
        store.end_transaction(false).unwrap();
    }

    #[test]
    fn test_tombstone_keeps_generation() {
        let (_dir, store) = setup();
        let id = DocId::new("doc1").unwrap();

        store.begin_transaction().unwrap();
        let (rev1, _) = put_doc(&store, &id, b"body", vec![]);
        store.end_transaction(true).unwrap();

        store.begin_transaction().unwrap();
        let outcome = store
            .put(PutRequest {
                id: id.clone(),
                body: Vec::new(),
                history: vec![rev1],
                deleted: true,
                has_attachments: false,
            })
            .unwrap();
        let rev2 = match outcome {
            PutOutcome::Committed { rev_id, .. } => rev_id,
            PutOutcome::Conflict => panic!("unexpected conflict"),
        };
        assert_eq!(rev2.generation(), 2);
        store.end_transaction(true).unwrap();

        let raw = store.get_document(&id).unwrap().unwrap();
        assert!(raw.flags.deleted);
        assert!(raw.body.is_empty());

        // a tombstone may be overwritten without naming its revision
        store.begin_transaction().unwrap();
        let (rev3, _) = put_doc(&store, &id, b"back", vec![]);
        assert_eq!(rev3.generation(), 3);
        store.end_transaction(true).unwrap();
    }

    #[test]
    fn test_observer_batches() {
        let (_dir, store) = setup();
        let observer = store.observe(|| {});

        store.begin_transaction().unwrap();
        for i in 0..5 {
            let id = DocId::new(format!("doc{}", i)).unwrap();
            put_doc(&store, &id, b"body", vec![]);
        }
        store.end_transaction(true).unwrap();

        let (entries, external) = observer.get_changes(3);
        assert_eq!(entries.len(), 3);
        assert!(!external);
        let (entries, _) = observer.get_changes(100);
        assert_eq!(entries.len(), 2);
        let (entries, _) = observer.get_changes(100);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_external_change_detection() {
        let dir = TempDir::new().unwrap();
        let opts = StoreOptions {
            create: true,
            ..Default::default()
        };
        let store_a = RevStore::open(dir.path(), opts.clone()).unwrap();
        let store_b = RevStore::open(dir.path(), opts).unwrap();
        let observer = store_a.observe(|| {});

        let id = DocId::new("doc1").unwrap();
        store_b.begin_transaction().unwrap();
        put_doc(&store_b, &id, b"from-b", vec![]);
        store_b.end_transaction(true).unwrap();

        // store_a notices on its next use
        let raw = store_a.get_document(&id).unwrap().unwrap();
        assert_eq!(raw.body, b"from-b");
        let (entries, external) = observer.get_changes(100);
        assert_eq!(entries.len(), 1);
        assert!(external);
        assert_eq!(entries[0].doc_id, id);
        assert_eq!(store_a.last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_meta_roundtrip() {
        let (_dir, store) = setup();
        assert!(store.read_meta(SHARED_KEYS_META).unwrap().is_none());

        store.begin_transaction().unwrap();
        store.put_meta(SHARED_KEYS_META, b"[\"name\"]").unwrap();
        // staged value readable inside the transaction
        assert_eq!(
            store.read_meta(SHARED_KEYS_META).unwrap().unwrap(),
            b"[\"name\"]"
        );
        store.end_transaction(true).unwrap();

        assert_eq!(
            store.read_meta(SHARED_KEYS_META).unwrap().unwrap(),
            b"[\"name\"]"
        );
    }
}
