//! Main branch management.
//!
//! The store keeps its entire state behind a single ref. Every committed
//! transaction advances it by compare-and-swap: the update only succeeds if
//! the ref still points at the commit the transaction was based on, which is
//! what turns a mid-transaction external write into a clean contention error
//! instead of silent data loss.

use git2::Repository;

use crate::storage::errors::{StorageError, StorageResult};
use crate::storage::types::CommitId;

/// Manages the store's head reference.
pub(crate) struct RefManager;

impl RefManager {
    pub(crate) const MAIN_REF: &'static str = "refs/heads/main";

    /// Resolve the head commit of the store.
    pub(crate) fn head(repo: &Repository) -> StorageResult<CommitId> {
        let reference = repo.find_reference(Self::MAIN_REF).map_err(|e| {
            if e.code() == git2::ErrorCode::NotFound || e.code() == git2::ErrorCode::UnbornBranch {
                StorageError::EmptyStore
            } else {
                StorageError::Git(e)
            }
        })?;

        let commit = reference
            .peel_to_commit()
            .map_err(|_| StorageError::RefNotFound(Self::MAIN_REF.to_string()))?;

        Ok(CommitId::new(commit.id()))
    }

    /// Point the main ref at the initial commit of a fresh store.
    pub(crate) fn init(repo: &Repository, initial: CommitId) -> StorageResult<()> {
        let commit = repo.find_commit(initial.raw())?;
        repo.branch("main", &commit, false)?;
        repo.set_head(Self::MAIN_REF)?;
        Ok(())
    }

    /// Advance main only if it still points at the expected commit.
    ///
    /// This provides compare-and-swap semantics for safe concurrent commits.
    pub(crate) fn advance(
        repo: &Repository,
        expected: CommitId,
        target: CommitId,
    ) -> StorageResult<()> {
        let current = Self::head(repo)?;
        if current != expected {
            return Err(StorageError::CommitContention);
        }

        let mut reference = repo
            .find_reference(Self::MAIN_REF)
            .map_err(|_| StorageError::RefNotFound(Self::MAIN_REF.to_string()))?;
        reference.set_target(target.raw(), &format!("advance store to {}", target.short()))?;

        Ok(())
    }
}
