//! Change-notification dispatch.
//!
//! The database registers a single observer with the revision store. When
//! the store signals new entries, the dispatcher pulls them in batches of up
//! to 100 and accumulates document ids until the external flag flips, 1000
//! ids are buffered, or the queue drains - then emits one event per batch.
//! External entries are additionally routed to the affected live documents
//! so they can reload (or defer to conflict handling if they have pending
//! mutations).

use tracing::warn;

use crate::db::api::Database;
use crate::document::Document;
use crate::storage::ChangeEntry;

/// pull size against the store observer
const PULL_BATCH: usize = 100;
/// maximum ids buffered into one event
const MAX_EVENT_IDS: usize = 1000;

/// One batch of document changes.
#[derive(Debug, Clone)]
pub struct DatabaseChange {
    /// ids of the documents that changed, in commit order
    pub doc_ids: Vec<String>,
    /// highest sequence among the batched changes
    pub last_sequence: u64,
    /// whether the changes came from another handle of this database
    pub external: bool,
}

impl Database {
    /// Drain the store observer and emit change events.
    ///
    /// Runs outside the store lock; a no-op while a transaction is open
    /// (the store signals again once it commits).
    pub(crate) fn dispatch_changes(&self) {
        let observer = {
            let state = self.inner.state.lock();
            match &state.observer {
                Some(observer) => observer.clone(),
                None => return,
            }
        };
        if self.inner.store.is_in_transaction() {
            return;
        }

        let mut doc_ids: Vec<String> = Vec::new();
        let mut batch_external = false;
        let mut last_sequence = 0u64;
        loop {
            let (entries, external) = observer.get_changes(PULL_BATCH);
            if entries.is_empty() {
                break;
            }
            if !doc_ids.is_empty() && external != batch_external {
                self.emit_change(std::mem::take(&mut doc_ids), last_sequence, batch_external);
            }
            batch_external = external;
            if external {
                self.route_external(&entries);
            }
            for entry in entries {
                last_sequence = last_sequence.max(entry.sequence);
                doc_ids.push(entry.doc_id.into_string());
                if doc_ids.len() >= MAX_EVENT_IDS {
                    self.emit_change(std::mem::take(&mut doc_ids), last_sequence, batch_external);
                }
            }
        }
        if !doc_ids.is_empty() {
            self.emit_change(doc_ids, last_sequence, batch_external);
        }
    }

    /// hand external changes to the live documents they concern
    fn route_external(&self, entries: &[ChangeEntry]) {
        // another handle may have grown the shared key table
        if let Err(error) = self.reload_shared_keys_doc() {
            warn!(%error, "shared key reload failed");
        }
        for entry in entries {
            let documents: Vec<Document> = {
                let mut state = self.inner.state.lock();
                match state.registry.get_mut(entry.doc_id.as_str()) {
                    Some(slot) => {
                        slot.retain(|weak| weak.strong_count() > 0);
                        slot.iter()
                            .filter_map(|weak| weak.upgrade())
                            .map(Document::from_inner)
                            .collect()
                    }
                    None => Vec::new(),
                }
            };
            for document in documents {
                // a failed reload must not break the dispatch loop
                if let Err(error) = document.changed_externally() {
                    warn!(id = %entry.doc_id, %error, "external reload failed");
                }
            }
        }
    }

    fn emit_change(&self, doc_ids: Vec<String>, last_sequence: u64, external: bool) {
        let listeners: Vec<_> = {
            let state = self.inner.state.lock();
            state.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        if listeners.is_empty() {
            return;
        }
        let change = DatabaseChange {
            doc_ids,
            last_sequence,
            external,
        };
        for listener in listeners {
            listener(&change);
        }
    }
}
