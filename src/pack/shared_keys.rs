//! Per-database shared key table.
//!
//! Dictionary keys that repeat across documents ("name", "type", ...) are
//! interned once and referenced by small integer ids in every body. The
//! table is monotonic: ids are only ever appended, never reassigned, so a
//! reader holding an old body can always resolve its keys against a newer
//! table. The persisted form is a plain JSON array of strings; index is id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::pack::{PackError, PackResult};

/// keys longer than this are always written inline
const MAX_SHARED_KEY_LEN: usize = 16;

/// Monotonic int <-> string key-interning table.
///
/// Clone this to share it - it uses Arc internally. Safe to hand to decoders
/// by shared reference because updates are adds only.
#[derive(Clone, Default)]
pub struct SharedKeys {
    inner: Arc<RwLock<SharedKeysInner>>,
}

#[derive(Default)]
struct SharedKeysInner {
    by_id: Vec<String>,
    by_name: HashMap<String, u32>,
}

impl SharedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// check whether a key is allowed into the table
    ///
    /// Short alphanumeric keys only; anything else is written inline so the
    /// table stays small and cheap to persist.
    pub fn is_eligible(key: &str) -> bool {
        !key.is_empty()
            && key.len() <= MAX_SHARED_KEY_LEN
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    /// look up the id of an already-interned key
    pub fn id_of(&self, key: &str) -> Option<u32> {
        self.inner.read().by_name.get(key).copied()
    }

    /// resolve an id back to its key string
    pub fn resolve(&self, id: u32) -> Option<String> {
        self.inner.read().by_id.get(id as usize).cloned()
    }

    /// intern a key, returning its id; None if the key is not eligible
    pub fn intern(&self, key: &str) -> Option<u32> {
        if !Self::is_eligible(key) {
            return None;
        }
        if let Some(id) = self.id_of(key) {
            return Some(id);
        }
        let mut inner = self.inner.write();
        // re-check under the write lock
        if let Some(id) = inner.by_name.get(key) {
            return Some(*id);
        }
        let id = inner.by_id.len() as u32;
        inner.by_id.push(key.to_string());
        inner.by_name.insert(key.to_string(), id);
        Some(id)
    }

    /// number of interned keys
    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// snapshot of the table for persistence, index is id
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.read().by_id.clone()
    }

    /// Merge a persisted table into this one.
    ///
    /// Existing ids must agree with the stored list; new stored keys are
    /// appended. A disagreement means the stored table was produced by a
    /// different history and bodies can no longer be decoded safely.
    pub fn merge_from(&self, stored: &[String]) -> PackResult<()> {
        let mut inner = self.inner.write();
        for (id, key) in stored.iter().enumerate() {
            match inner.by_id.get(id) {
                Some(existing) if existing != key => {
                    return Err(PackError::KeyTableMismatch {
                        id,
                        existing: existing.clone(),
                        stored: key.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    inner.by_id.push(key.clone());
                    inner.by_name.insert(key.clone(), id as u32);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_monotonic() {
        let keys = SharedKeys::new();
        let a = keys.intern("name").unwrap();
        let b = keys.intern("type").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(keys.intern("name"), Some(0));
        assert_eq!(keys.resolve(1).as_deref(), Some("type"));
        assert_eq!(keys.count(), 2);
    }

    #[test]
    fn test_eligibility() {
        assert!(SharedKeys::is_eligible("name"));
        assert!(SharedKeys::is_eligible("content-type"));
        assert!(!SharedKeys::is_eligible(""));
        assert!(!SharedKeys::is_eligible("a key with spaces"));
        assert!(!SharedKeys::is_eligible("averyveryverylongkeyname"));
        assert_eq!(SharedKeys::new().intern("not a key"), None);
    }

    #[test]
    fn test_merge_from_appends() {
        let keys = SharedKeys::new();
        keys.intern("name").unwrap();
        keys.merge_from(&["name".into(), "age".into()]).unwrap();
        assert_eq!(keys.id_of("age"), Some(1));
        assert_eq!(keys.count(), 2);
    }

    #[test]
    fn test_merge_from_detects_mismatch() {
        let keys = SharedKeys::new();
        keys.intern("name").unwrap();
        let result = keys.merge_from(&["other".into()]);
        assert!(matches!(result, Err(PackError::KeyTableMismatch { .. })));
    }
}
