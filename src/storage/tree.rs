//! tree operations for the store layout.
//!
//! in Git, a tree is a directory. In the store:
//! - the root tree contains the `docs` directory and the `_meta` directory
//! - `docs` holds one record file per document
//! - `_meta` holds the sequence counter, the shared key table and the
//!   persisted index definitions
//!
//! this module provides safe abstractions over Git's tree manipulation,
//! which is notoriously fiddly to get right.

use git2::{FileMode, ObjectType, Repository, Tree, TreeBuilder};

use crate::storage::errors::{StorageError, StorageResult};
use crate::storage::types::DocId;

pub(crate) const DOCS_DIR: &str = "docs";
pub(crate) const META_DIR: &str = "_meta";

/// A read-only view of the store tree at a specific commit.
///
/// Think of it as a snapshot - it won't change even if new commits are made.
pub(crate) struct Snapshot<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> Snapshot<'repo> {
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    pub(crate) fn inner(&self) -> &Tree<'repo> {
        &self.tree
    }

    fn subtree(&self, repo: &'repo Repository, name: &str) -> StorageResult<Option<Tree<'repo>>> {
        match self.tree.get_name(name) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Tree) {
                    return Err(StorageError::CorruptedData {
                        path: name.to_string(),
                        reason: format!("expected tree, found {:?}", entry.kind()),
                    });
                }
                Ok(Some(repo.find_tree(entry.id())?))
            }
            None => Ok(None),
        }
    }

    /// OID of a document's record blob, if present
    pub(crate) fn record_oid(
        &self,
        repo: &'repo Repository,
        id: &DocId,
    ) -> StorageResult<Option<git2::Oid>> {
        let docs = match self.subtree(repo, DOCS_DIR)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let result = match docs.get_name(id.as_str()) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Blob) {
                    return Err(StorageError::CorruptedData {
                        path: format!("{}/{}", DOCS_DIR, id),
                        reason: format!("expected blob, found {:?}", entry.kind()),
                    });
                }
                Ok(Some(entry.id()))
            }
            None => Ok(None),
        };
        result
    }

    /// OID of a metadata file, if present
    pub(crate) fn meta_oid(
        &self,
        repo: &'repo Repository,
        name: &str,
    ) -> StorageResult<Option<git2::Oid>> {
        let meta = match self.subtree(repo, META_DIR)? {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(meta.get_name(name).map(|entry| entry.id()))
    }
}

/// A mutable tree builder for staging record and metadata changes.
///
/// Changes accumulate and produce a new root tree on `write()`; the original
/// tree is not modified.
pub(crate) struct TreeEditor<'repo> {
    repo: &'repo Repository,
    root: TreeBuilder<'repo>,
    docs: TreeBuilder<'repo>,
    meta: TreeBuilder<'repo>,
}

impl<'repo> TreeEditor<'repo> {
    /// start editing from an existing snapshot
    pub(crate) fn from_snapshot(
        repo: &'repo Repository,
        snapshot: &Snapshot<'repo>,
    ) -> StorageResult<Self> {
        let root = repo.treebuilder(Some(snapshot.inner()))?;
        let docs = match snapshot.subtree(repo, DOCS_DIR)? {
            Some(tree) => repo.treebuilder(Some(&tree))?,
            None => repo.treebuilder(None)?,
        };
        let meta = match snapshot.subtree(repo, META_DIR)? {
            Some(tree) => repo.treebuilder(Some(&tree))?,
            None => repo.treebuilder(None)?,
        };
        Ok(Self {
            repo,
            root,
            docs,
            meta,
        })
    }

    /// start editing from nothing (store initialization)
    pub(crate) fn empty(repo: &'repo Repository) -> StorageResult<Self> {
        Ok(Self {
            repo,
            root: repo.treebuilder(None)?,
            docs: repo.treebuilder(None)?,
            meta: repo.treebuilder(None)?,
        })
    }

    /// insert or replace a document record
    pub(crate) fn put_record(&mut self, id: &DocId, record_oid: git2::Oid) -> StorageResult<()> {
        self.docs
            .insert(id.as_str(), record_oid, FileMode::Blob.into())?;
        Ok(())
    }

    /// remove a document record (purge); missing entries are ignored
    pub(crate) fn remove_record(&mut self, id: &DocId) -> StorageResult<()> {
        if self.docs.get(id.as_str())?.is_some() {
            self.docs.remove(id.as_str())?;
        }
        Ok(())
    }

    /// insert or replace a metadata file
    pub(crate) fn put_meta(&mut self, name: &str, oid: git2::Oid) -> StorageResult<()> {
        self.meta.insert(name, oid, FileMode::Blob.into())?;
        Ok(())
    }

    /// write all changes and return the new root tree OID
    pub(crate) fn write(mut self) -> StorageResult<git2::Oid> {
        let docs_id = self.docs.write()?;
        self.root.insert(DOCS_DIR, docs_id, FileMode::Tree.into())?;
        let meta_id = self.meta.write()?;
        self.root.insert(META_DIR, meta_id, FileMode::Tree.into())?;
        Ok(self.root.write()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_record_roundtrip() {
        let (_dir, repo) = setup_repo();
        let id = DocId::new("doc1").unwrap();
        let record_oid = repo.blob(b"{}").unwrap();

        let mut editor = TreeEditor::empty(&repo).unwrap();
        editor.put_record(&id, record_oid).unwrap();
        let tree_oid = editor.write().unwrap();

        let tree = repo.find_tree(tree_oid).unwrap();
        let snapshot = Snapshot::new(tree);
        assert_eq!(snapshot.record_oid(&repo, &id).unwrap(), Some(record_oid));

        let other = DocId::new("doc2").unwrap();
        assert!(snapshot.record_oid(&repo, &other).unwrap().is_none());
    }

    #[test]
    fn test_remove_record() {
        let (_dir, repo) = setup_repo();
        let id = DocId::new("doc1").unwrap();
        let record_oid = repo.blob(b"{}").unwrap();

        let mut editor = TreeEditor::empty(&repo).unwrap();
        editor.put_record(&id, record_oid).unwrap();
        let tree_oid = editor.write().unwrap();

        let tree = repo.find_tree(tree_oid).unwrap();
        let snapshot = Snapshot::new(tree);
        let mut editor = TreeEditor::from_snapshot(&repo, &snapshot).unwrap();
        editor.remove_record(&id).unwrap();
        // removing a missing record is not an error
        editor.remove_record(&DocId::new("ghost").unwrap()).unwrap();
        let tree_oid = editor.write().unwrap();

        let tree = repo.find_tree(tree_oid).unwrap();
        let snapshot = Snapshot::new(tree);
        assert!(snapshot.record_oid(&repo, &id).unwrap().is_none());
    }

    #[test]
    fn test_meta_roundtrip() {
        let (_dir, repo) = setup_repo();
        let oid = repo.blob(b"[\"name\"]").unwrap();

        let mut editor = TreeEditor::empty(&repo).unwrap();
        editor.put_meta("shared_keys", oid).unwrap();
        let tree_oid = editor.write().unwrap();

        let tree = repo.find_tree(tree_oid).unwrap();
        let snapshot = Snapshot::new(tree);
        assert_eq!(snapshot.meta_oid(&repo, "shared_keys").unwrap(), Some(oid));
        assert!(snapshot.meta_oid(&repo, "info").unwrap().is_none());
    }
}
