//! The property container core.
//!
//! A container is a staged, mutable overlay on top of the immutable encoded
//! root of the currently persisted revision. Reads fall through to the root
//! and decode on demand; writes stage converted values and track which keys
//! differ from the root. Subdocuments and lists are memoized on first read
//! so their identity is observable and stable; scalars are re-decoded each
//! time so the staged map only grows for what was actually written.
//!
//! Both `Document` and `Subdocument` are thin handles around one of these.
//! A subdocument additionally carries a parent link and a change hook that
//! bubbles every mutation up to the root document.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::db::Database;
use crate::document::blob::Blob;
use crate::document::document::DocInner;
use crate::document::errors::DocumentResult;
use crate::document::subdocument::Subdocument;
use crate::document::value::{
    decode_dict_plain, decode_packed_plain, packed_dict_is_blob, validate_value, PropertyMap,
    Value, BLOB_TYPE, TYPE_KEY,
};
use crate::pack::{PackedArray, PackedDict, PackedValue, SharedKeys};

pub(crate) type ContainerRef = Arc<ContainerInner>;
pub(crate) type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// link from a subdocument to the container holding it
pub(crate) struct ParentLink {
    pub(crate) container: Weak<ContainerInner>,
    pub(crate) key: String,
}

/// the lockable state of one container
#[derive(Default)]
pub(crate) struct PropertyStore {
    /// encoded dictionary of the persisted revision, if any
    pub(crate) root: Option<PackedDict>,
    /// staged values masking the root; lazily materialized
    pub(crate) staged: Option<BTreeMap<String, Value>>,
    /// staged keys that must be written on the next save
    pub(crate) changed: BTreeSet<String>,
    pub(crate) shared_keys: Option<SharedKeys>,
    pub(crate) database: Option<Database>,
    /// set for subdocuments only
    pub(crate) parent: Option<ParentLink>,
    /// set for the root container of a document only
    pub(crate) owner: Option<Weak<DocInner>>,
    /// bubbles mutations upward; fires the mutation event at the root
    pub(crate) on_change: Option<ChangeHook>,
}

pub(crate) struct ContainerInner {
    pub(crate) store: Mutex<PropertyStore>,
}

impl ContainerInner {
    pub(crate) fn new_detached() -> ContainerRef {
        Arc::new(ContainerInner {
            store: Mutex::new(PropertyStore::default()),
        })
    }

    // ==================== Reads ====================

    pub(crate) fn has_changes(&self) -> bool {
        !self.store.lock().changed.is_empty()
    }

    /// effective value for a key; memoizes subdocuments and lists only
    pub(crate) fn get(self: &Arc<Self>, key: &str) -> Value {
        let mut store = self.store.lock();
        if let Some(staged) = &store.staged {
            if let Some(value) = staged.get(key) {
                return value.clone();
            }
        }
        let root = match &store.root {
            Some(root) => root.clone(),
            None => return Value::Null,
        };
        let packed = match root.get(key) {
            Ok(Some(packed)) => packed,
            Ok(None) => return Value::Null,
            Err(error) => {
                warn!(key, %error, "undecodable property");
                return Value::Null;
            }
        };
        let (value, memoize) = self.decode_for_read(&mut store, key, packed);
        if memoize {
            store
                .staged
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.clone());
        }
        value
    }

    /// true iff the effective value is non-null
    pub(crate) fn contains(&self, key: &str) -> bool {
        let store = self.store.lock();
        if let Some(staged) = &store.staged {
            if let Some(value) = staged.get(key) {
                return !value.is_null();
            }
        }
        match &store.root {
            Some(root) => {
                matches!(root.get(key), Ok(Some(packed)) if !matches!(packed, PackedValue::Null))
            }
            None => false,
        }
    }

    pub(crate) fn get_bool(&self, key: &str) -> bool {
        let store = self.store.lock();
        match staged_value(&store, key) {
            Some(value) => value.as_bool(),
            None => root_scalar(&store, key).map(|v| v.as_bool()).unwrap_or(false),
        }
    }

    pub(crate) fn get_long(&self, key: &str) -> i64 {
        let store = self.store.lock();
        match staged_value(&store, key) {
            Some(value) => value.as_long(),
            None => root_scalar(&store, key).map(|v| v.as_long()).unwrap_or(0),
        }
    }

    pub(crate) fn get_double(&self, key: &str) -> f64 {
        let store = self.store.lock();
        match staged_value(&store, key) {
            Some(value) => value.as_double(),
            None => root_scalar(&store, key).map(|v| v.as_double()).unwrap_or(0.0),
        }
    }

    pub(crate) fn get_float(&self, key: &str) -> f32 {
        let store = self.store.lock();
        match staged_value(&store, key) {
            Some(value) => value.as_float(),
            None => root_scalar(&store, key).map(|v| v.as_float()).unwrap_or(0.0),
        }
    }

    pub(crate) fn get_string(&self, key: &str) -> Option<String> {
        let store = self.store.lock();
        match staged_value(&store, key) {
            Some(value) => value.as_string(),
            None => root_scalar(&store, key).and_then(|v| v.as_string()),
        }
    }

    pub(crate) fn get_date(&self, key: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
        let store = self.store.lock();
        match staged_value(&store, key) {
            Some(value) => value.as_date(),
            None => root_scalar(&store, key).and_then(|v| v.as_date()),
        }
    }

    /// blobs are rebuilt from the root on each read; equality is by digest
    pub(crate) fn get_blob(&self, key: &str) -> Option<Blob> {
        let store = self.store.lock();
        if let Some(value) = staged_value(&store, key) {
            return value.as_blob();
        }
        if let Some(root) = &store.root {
            if let Ok(Some(PackedValue::Dict(dict))) = root.get(key) {
                if packed_dict_is_blob(&dict) {
                    return Blob::from_packed(&dict, store.database.clone()).ok();
                }
            }
        }
        None
    }

    pub(crate) fn get_array(self: &Arc<Self>, key: &str) -> Option<Vec<Value>> {
        self.get(key).as_array()
    }

    pub(crate) fn get_subdocument(self: &Arc<Self>, key: &str) -> Option<Subdocument> {
        self.get(key).as_subdocument()
    }

    /// snapshot of all non-null effective values
    ///
    /// The first call backfills the staged map with everything the root
    /// holds, so iteration stays stable across later reads.
    pub(crate) fn properties(self: &Arc<Self>) -> PropertyMap {
        let mut store = self.store.lock();
        self.backfill(&mut store);
        match &store.staged {
            Some(staged) => staged
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            None => PropertyMap::new(),
        }
    }

    /// plain decode of the persisted root, no staging, no live containers
    pub(crate) fn root_snapshot(&self) -> PropertyMap {
        let store = self.store.lock();
        match &store.root {
            Some(root) => decode_dict_plain(root, &store.database).unwrap_or_else(|error| {
                warn!(%error, "undecodable root");
                PropertyMap::new()
            }),
            None => PropertyMap::new(),
        }
    }

    // ==================== Writes ====================

    /// Stage a value.
    ///
    /// No-ops when the value equals the current effective value; otherwise
    /// converts it (adopting or displacing subdocuments), marks the key
    /// changed, and bubbles the mutation.
    pub(crate) fn set(self: &Arc<Self>, key: &str, value: Value) -> DocumentResult<()> {
        validate_value(&value)?;
        let hook = {
            let mut store = self.store.lock();
            if effective_for_compare(&store, key) == value {
                return Ok(());
            }
            let old = store.staged.as_ref().and_then(|m| m.get(key).cloned());
            let converted = self.convert(&mut store, key, value, old)?;
            store
                .staged
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), converted);
            store.changed.insert(key.to_string());
            store.on_change.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    pub(crate) fn remove(self: &Arc<Self>, key: &str) -> DocumentResult<()> {
        self.set(key, Value::Null)
    }

    /// Bulk replacement.
    ///
    /// Every key of the previous state that the new map omits is staged as
    /// null and marked changed, so the next save writes a full replacement.
    /// Unlike `set`, this records those removals even when the prior value
    /// was already null.
    pub(crate) fn replace_properties(
        self: &Arc<Self>,
        new: Option<PropertyMap>,
    ) -> DocumentResult<()> {
        self.replace_properties_inner(new, true)
    }

    pub(crate) fn replace_properties_inner(
        self: &Arc<Self>,
        new: Option<PropertyMap>,
        notify: bool,
    ) -> DocumentResult<()> {
        if let Some(map) = &new {
            for value in map.values() {
                validate_value(value)?;
            }
        }
        let hook = {
            let mut store = self.store.lock();
            let mut previous: BTreeSet<String> = store
                .staged
                .as_ref()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            if let Some(root) = &store.root {
                match root.entries() {
                    Ok(entries) => {
                        for (key, _) in entries {
                            previous.insert(key);
                        }
                    }
                    Err(error) => warn!(%error, "undecodable root"),
                }
            }

            let old_staged = store.staged.take().unwrap_or_default();
            let mut next: BTreeMap<String, Value> = BTreeMap::new();
            for (key, value) in new.unwrap_or_default() {
                let old = old_staged.get(&key).cloned();
                let converted = self.convert(&mut store, &key, value, old)?;
                store.changed.insert(key.clone());
                next.insert(key, converted);
            }

            let mut kept = Vec::new();
            for value in next.values() {
                collect_subdocs(value, &mut kept);
            }
            for (key, value) in &old_staged {
                if !next.contains_key(key) {
                    invalidate_displaced(value, &kept);
                }
            }
            for key in previous {
                if !next.contains_key(&key) {
                    store.changed.insert(key.clone());
                    next.insert(key, Value::Null);
                }
            }

            store.staged = Some(next);
            if notify {
                store.on_change.clone()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Drop staged changes.
    ///
    /// Subdocuments that still have a persisted root are reverted in place
    /// and stay mounted; everything else staged under a changed key is
    /// discarded, with displaced subdocuments invalidated.
    pub(crate) fn revert(self: &Arc<Self>) {
        let mut store = self.store.lock();
        let changed: Vec<String> = store.changed.iter().cloned().collect();
        if let Some(staged) = &mut store.staged {
            for key in &changed {
                match staged.remove(key) {
                    Some(Value::Subdoc(sd)) => {
                        if sd.exists() {
                            sd.inner().revert();
                            staged.insert(key.clone(), Value::Subdoc(sd));
                        } else {
                            sd.inner().invalidate();
                        }
                    }
                    Some(other) => invalidate_displaced(&other, &[]),
                    None => {}
                }
            }
        }
        store.changed.clear();
    }

    // ==================== Lifecycle ====================

    /// Rebind to the encoded root of a new revision.
    ///
    /// Staged subdocuments are re-rooted at their key (recursively through
    /// lists, by index) or invalidated when the new root no longer has a
    /// dictionary there. Staged scalars are discarded so later reads pull
    /// fresh values.
    pub(crate) fn use_new_root(self: &Arc<Self>, new_root: Option<PackedDict>) {
        let mut store = self.store.lock();
        store.root = new_root.clone();
        let staged = match &mut store.staged {
            Some(staged) => staged,
            None => return,
        };
        let keys: Vec<String> = staged.keys().cloned().collect();
        for key in keys {
            match staged.remove(&key).expect("key just listed") {
                Value::Subdoc(sd) => {
                    let child_root = new_root.as_ref().and_then(|root| match root.get(&key) {
                        Ok(Some(PackedValue::Dict(d))) if !packed_dict_is_blob(&d) => Some(d),
                        _ => None,
                    });
                    match child_root {
                        Some(dict) => {
                            sd.inner().use_new_root(Some(dict));
                            staged.insert(key, Value::Subdoc(sd));
                        }
                        None => sd.inner().invalidate(),
                    }
                }
                Value::Array(mut items) => {
                    let child_array = new_root.as_ref().and_then(|root| match root.get(&key) {
                        Ok(Some(PackedValue::Array(a))) => Some(a),
                        _ => None,
                    });
                    match child_array {
                        Some(array) => {
                            rebind_array(&mut items, &array);
                            staged.insert(key, Value::Array(items));
                        }
                        None => invalidate_displaced(&Value::Array(items), &[]),
                    }
                }
                _ => {} // scalar; discarded
            }
        }
    }

    /// clear the changed-key sets of this container and everything staged
    pub(crate) fn clear_changes_recursive(self: &Arc<Self>) {
        let mut store = self.store.lock();
        store.changed.clear();
        if let Some(staged) = &store.staged {
            for value in staged.values() {
                clear_value_changes(value);
            }
        }
    }

    /// drop the whole staged state (after a purge)
    pub(crate) fn discard_state(&self) {
        let mut store = self.store.lock();
        store.staged = None;
        store.changed.clear();
    }

    /// Detach this container entirely.
    ///
    /// A displaced subdocument becomes an empty detached container: parent
    /// link, root binding, staged map and change set all clear together.
    pub(crate) fn invalidate(&self) {
        let mut store = self.store.lock();
        store.parent = None;
        store.on_change = None;
        store.root = None;
        store.staged = None;
        store.changed.clear();
        store.database = None;
        store.shared_keys = None;
    }

    pub(crate) fn has_root(&self) -> bool {
        self.store.lock().root.is_some()
    }

    // ==================== Conversion ====================

    /// Convert an incoming value for staging at `key`: subdocuments are
    /// adopted or copied, plain maps become subdocuments (or blobs, for the
    /// typed dictionary shape), lists convert element-wise, and displaced
    /// instances are invalidated.
    fn convert(
        self: &Arc<Self>,
        store: &mut PropertyStore,
        key: &str,
        new: Value,
        old: Option<Value>,
    ) -> DocumentResult<Value> {
        match new {
            Value::Subdoc(sd) => {
                let (has_parent, is_ours) = {
                    let child = sd.inner().store.lock();
                    match &child.parent {
                        Some(link) => (
                            true,
                            link.container.ptr_eq(&Arc::downgrade(self)) && link.key == key,
                        ),
                        None => (false, false),
                    }
                };
                if has_parent {
                    if is_ours {
                        // reorder inside a list: same owner, same key
                        return Ok(Value::Subdoc(sd));
                    }
                    // owned elsewhere: copy content instead of re-parenting
                    let props = sd.properties();
                    let target = match &old {
                        Some(Value::Subdoc(old_sd)) => old_sd.clone(),
                        _ => Subdocument::from_inner(self.new_child(store, key, None)),
                    };
                    target.inner().replace_properties_inner(Some(props), false)?;
                    if let Some(old_value) = &old {
                        invalidate_displaced(old_value, &[target.clone()]);
                    }
                    return Ok(Value::Subdoc(target));
                }
                // unowned: adopt
                {
                    let mut child = sd.inner().store.lock();
                    child.parent = Some(ParentLink {
                        container: Arc::downgrade(self),
                        key: key.to_string(),
                    });
                    child.on_change = Some(bubble_hook(self, key));
                    if child.shared_keys.is_none() {
                        child.shared_keys = store.shared_keys.clone();
                    }
                    if child.database.is_none() {
                        child.database = store.database.clone();
                    }
                }
                if let Some(old_value) = &old {
                    invalidate_displaced(old_value, &[sd.clone()]);
                }
                Ok(Value::Subdoc(sd))
            }
            Value::Dict(map) => {
                if matches!(map.get(TYPE_KEY), Some(Value::String(kind)) if kind == BLOB_TYPE) {
                    let blob = Blob::from_properties(&map, store.database.clone())?;
                    if let Some(old_value) = &old {
                        invalidate_displaced(old_value, &[]);
                    }
                    return Ok(Value::Blob(blob));
                }
                let target = match &old {
                    Some(Value::Subdoc(old_sd)) => old_sd.clone(),
                    _ => Subdocument::from_inner(self.new_child(store, key, None)),
                };
                target.inner().replace_properties_inner(Some(map), false)?;
                if let Some(old_value) = &old {
                    invalidate_displaced(old_value, &[target.clone()]);
                }
                Ok(Value::Subdoc(target))
            }
            Value::Array(items) => {
                let old_items: Vec<Value> = match &old {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let old_item = old_items.get(index).cloned();
                    out.push(self.convert(store, key, item, old_item)?);
                }
                // identity test over the surviving set; an instance used
                // twice in nested lists can be invalidated wrongly here
                let mut kept = Vec::new();
                for value in &out {
                    collect_subdocs(value, &mut kept);
                }
                if let Some(old_value) = &old {
                    invalidate_displaced(old_value, &kept);
                }
                Ok(Value::Array(out))
            }
            other => {
                if let Some(old_value) = &old {
                    invalidate_displaced(old_value, &[]);
                }
                Ok(other)
            }
        }
    }

    // ==================== Internal ====================

    /// decode a root value for `get`; the bool says whether to memoize
    fn decode_for_read(
        self: &Arc<Self>,
        store: &mut PropertyStore,
        key: &str,
        packed: PackedValue,
    ) -> (Value, bool) {
        match packed {
            PackedValue::Dict(dict) => {
                if packed_dict_is_blob(&dict) {
                    match Blob::from_packed(&dict, store.database.clone()) {
                        Ok(blob) => (Value::Blob(blob), false),
                        Err(error) => {
                            warn!(key, %error, "undecodable blob reference");
                            (Value::Null, false)
                        }
                    }
                } else {
                    let child = self.new_child(store, key, Some(dict));
                    (Value::Subdoc(Subdocument::from_inner(child)), true)
                }
            }
            PackedValue::Array(array) => match self.decode_array(store, key, &array) {
                Ok(items) => (Value::Array(items), true),
                Err(error) => {
                    warn!(key, %error, "undecodable array");
                    (Value::Null, false)
                }
            },
            scalar => (scalar_to_value(scalar), false),
        }
    }

    fn decode_array(
        self: &Arc<Self>,
        store: &mut PropertyStore,
        key: &str,
        array: &PackedArray,
    ) -> DocumentResult<Vec<Value>> {
        let mut out = Vec::new();
        for packed in array.items()? {
            out.push(match packed {
                PackedValue::Dict(dict) => {
                    if packed_dict_is_blob(&dict) {
                        Value::Blob(Blob::from_packed(&dict, store.database.clone())?)
                    } else {
                        let child = self.new_child(store, key, Some(dict));
                        Value::Subdoc(Subdocument::from_inner(child))
                    }
                }
                PackedValue::Array(nested) => Value::Array(self.decode_array(store, key, &nested)?),
                scalar => scalar_to_value(scalar),
            });
        }
        Ok(out)
    }

    /// a child container parented at `key`, optionally mounted on a root
    fn new_child(
        self: &Arc<Self>,
        store: &PropertyStore,
        key: &str,
        root: Option<PackedDict>,
    ) -> ContainerRef {
        Arc::new(ContainerInner {
            store: Mutex::new(PropertyStore {
                root,
                staged: None,
                changed: BTreeSet::new(),
                shared_keys: store.shared_keys.clone(),
                database: store.database.clone(),
                parent: Some(ParentLink {
                    container: Arc::downgrade(self),
                    key: key.to_string(),
                }),
                owner: None,
                on_change: Some(bubble_hook(self, key)),
            }),
        })
    }

    fn backfill(self: &Arc<Self>, store: &mut PropertyStore) {
        let root = match &store.root {
            Some(root) => root.clone(),
            None => return,
        };
        let entries = match root.entries() {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "undecodable root");
                return;
            }
        };
        for (key, packed) in entries {
            let missing = store.staged.as_ref().map_or(true, |m| !m.contains_key(&key));
            if missing {
                let (value, _) = self.decode_for_read(store, &key, packed);
                store
                    .staged
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key, value);
            }
        }
    }
}

/// walk up the parent chain to the owning document
pub(crate) fn root_document(inner: &ContainerRef) -> Option<crate::document::Document> {
    let mut current = inner.clone();
    loop {
        let next = {
            let store = current.store.lock();
            if let Some(owner) = &store.owner {
                return owner.upgrade().map(crate::document::Document::from_inner);
            }
            store.parent.as_ref()?.container.upgrade()?
        };
        current = next;
    }
}

/// hook installed on a child; marks the key changed in the parent and keeps
/// bubbling. Each level releases its own lock before invoking the next.
fn bubble_hook(parent: &ContainerRef, key: &str) -> ChangeHook {
    let weak = Arc::downgrade(parent);
    let key = key.to_string();
    Arc::new(move || {
        if let Some(parent) = weak.upgrade() {
            let hook = {
                let mut store = parent.store.lock();
                store.changed.insert(key.clone());
                store.on_change.clone()
            };
            if let Some(hook) = hook {
                hook();
            }
        }
    })
}

fn staged_value(store: &PropertyStore, key: &str) -> Option<Value> {
    store.staged.as_ref().and_then(|m| m.get(key).cloned())
}

/// scalar fast path through the encoded root; containers come back as None
fn root_scalar(store: &PropertyStore, key: &str) -> Option<Value> {
    let root = store.root.as_ref()?;
    match root.get(key) {
        Ok(Some(packed)) => match packed {
            PackedValue::Dict(_) | PackedValue::Array(_) => None,
            scalar => Some(scalar_to_value(scalar)),
        },
        _ => None,
    }
}

fn scalar_to_value(packed: PackedValue) -> Value {
    match packed {
        PackedValue::Null => Value::Null,
        PackedValue::Bool(b) => Value::Bool(b),
        PackedValue::Int(i) => Value::Int(i),
        PackedValue::Float(f) => Value::Float(f),
        PackedValue::Double(f) => Value::Double(f),
        PackedValue::String(s) => Value::String(s),
        PackedValue::Dict(_) | PackedValue::Array(_) => Value::Null,
    }
}

/// effective value used by the set() no-op check; plain decode is enough
fn effective_for_compare(store: &PropertyStore, key: &str) -> Value {
    if let Some(staged) = &store.staged {
        if let Some(value) = staged.get(key) {
            return value.clone();
        }
    }
    if let Some(root) = &store.root {
        if let Ok(Some(packed)) = root.get(key) {
            if let Ok(value) = decode_packed_plain(&packed, &store.database) {
                return value;
            }
        }
    }
    Value::Null
}

/// invalidate every subdocument in `value` that is not in the kept set
fn invalidate_displaced(value: &Value, kept: &[Subdocument]) {
    match value {
        Value::Subdoc(sd) => {
            if !kept.iter().any(|k| Subdocument::ptr_eq(k, sd)) {
                sd.inner().invalidate();
            }
        }
        Value::Array(items) => {
            for item in items {
                invalidate_displaced(item, kept);
            }
        }
        _ => {}
    }
}

fn collect_subdocs(value: &Value, out: &mut Vec<Subdocument>) {
    match value {
        Value::Subdoc(sd) => out.push(sd.clone()),
        Value::Array(items) => {
            for item in items {
                collect_subdocs(item, out);
            }
        }
        _ => {}
    }
}

fn clear_value_changes(value: &Value) {
    match value {
        Value::Subdoc(sd) => sd.inner().clear_changes_recursive(),
        Value::Array(items) => {
            for item in items {
                clear_value_changes(item);
            }
        }
        _ => {}
    }
}

/// rebind list elements against the corresponding encoded array, by index
fn rebind_array(items: &mut [Value], new_array: &PackedArray) {
    for (index, item) in items.iter_mut().enumerate() {
        match item {
            Value::Subdoc(sd) => {
                let child = match new_array.get(index) {
                    Ok(Some(PackedValue::Dict(d))) if !packed_dict_is_blob(&d) => Some(d),
                    _ => None,
                };
                match child {
                    Some(dict) => sd.inner().use_new_root(Some(dict)),
                    None => sd.inner().invalidate(),
                }
            }
            Value::Array(nested) => match new_array.get(index) {
                Ok(Some(PackedValue::Array(a))) => rebind_array(nested, &a),
                _ => {
                    for inner in nested.iter() {
                        invalidate_displaced(inner, &[]);
                    }
                }
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::value::encode_map;

    fn rooted_container(map: &PropertyMap) -> ContainerRef {
        let keys = SharedKeys::new();
        let mut bytes = Vec::new();
        encode_map(map, &keys, &mut bytes).unwrap();
        let body = crate::pack::PackedBody::new(bytes, keys.clone());
        let container = ContainerInner::new_detached();
        {
            let mut store = container.store.lock();
            store.shared_keys = Some(keys);
            store.root = Some(body.root().unwrap());
        }
        container
    }

    fn sample_map() -> PropertyMap {
        let mut address = PropertyMap::new();
        address.insert("city".into(), Value::String("Berlin".into()));
        address.insert("zip".into(), Value::Int(10115));
        let mut map = PropertyMap::new();
        map.insert("name".into(), Value::String("Alice".into()));
        map.insert("age".into(), Value::Int(30));
        map.insert("address".into(), Value::Dict(address));
        map
    }

    #[test]
    fn test_set_then_get() {
        let c = ContainerInner::new_detached();
        c.set("name", Value::String("Bob".into())).unwrap();
        assert_eq!(c.get("name"), Value::String("Bob".into()));
        assert!(c.has_changes());
        assert!(c.contains("name"));
        assert!(!c.contains("other"));
    }

    #[test]
    fn test_set_equal_value_is_noop() {
        let c = rooted_container(&sample_map());
        c.set("age", Value::Int(30)).unwrap();
        assert!(!c.has_changes());
        // setting null over an absent key is a no-op too
        c.set("missing", Value::Null).unwrap();
        assert!(!c.has_changes());

        c.set("age", Value::Int(31)).unwrap();
        assert!(c.has_changes());
    }

    #[test]
    fn test_scalars_are_not_memoized() {
        let c = rooted_container(&sample_map());
        assert_eq!(c.get("name"), Value::String("Alice".into()));
        let store = c.store.lock();
        assert!(store.staged.is_none());
    }

    #[test]
    fn test_subdocument_identity_is_stable() {
        let c = rooted_container(&sample_map());
        let first = c.get_subdocument("address").unwrap();
        let second = c.get_subdocument("address").unwrap();
        assert!(Subdocument::ptr_eq(&first, &second));
        assert_eq!(first.get_string("city").as_deref(), Some("Berlin"));
        assert_eq!(first.get_long("zip"), 10115);
    }

    #[test]
    fn test_subdocument_mutation_bubbles() {
        let c = rooted_container(&sample_map());
        let address = c.get_subdocument("address").unwrap();
        assert!(!c.has_changes());
        address.set("city", "Hamburg").unwrap();
        assert!(address.has_changes());
        assert!(c.has_changes());
        assert!(c.store.lock().changed.contains("address"));
    }

    #[test]
    fn test_overwrite_invalidates_subdocument() {
        let c = rooted_container(&sample_map());
        let address = c.get_subdocument("address").unwrap();
        c.set("address", Value::Int(1)).unwrap();
        assert!(!address.exists());
        assert!(address.properties().is_empty());
        assert!(address.document().is_none());
    }

    #[test]
    fn test_remove_hides_root_value() {
        let c = rooted_container(&sample_map());
        c.remove("name").unwrap();
        assert_eq!(c.get("name"), Value::Null);
        assert!(!c.contains("name"));
        let props = c.properties();
        assert!(!props.contains_key("name"));
        assert!(props.contains_key("age"));
    }

    #[test]
    fn test_revert_restores_persisted_state() {
        let c = rooted_container(&sample_map());
        let address = c.get_subdocument("address").unwrap();
        address.set("city", "Hamburg").unwrap();
        c.set("age", Value::Int(99)).unwrap();
        c.set("extra", Value::Bool(true)).unwrap();

        c.revert();
        assert!(!c.has_changes());
        assert_eq!(c.get_long("age"), 30);
        assert_eq!(c.get("extra"), Value::Null);
        // the mounted subdocument was reverted, not discarded
        let again = c.get_subdocument("address").unwrap();
        assert!(Subdocument::ptr_eq(&address, &again));
        assert_eq!(again.get_string("city").as_deref(), Some("Berlin"));
    }

    #[test]
    fn test_replace_properties_marks_removals() {
        let c = rooted_container(&sample_map());
        let mut next = PropertyMap::new();
        next.insert("name".into(), Value::String("Carol".into()));
        c.replace_properties(Some(next)).unwrap();

        let store = c.store.lock();
        assert!(store.changed.contains("name"));
        assert!(store.changed.contains("age"));
        assert!(store.changed.contains("address"));
        drop(store);

        let props = c.properties();
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("name"), Some(&Value::String("Carol".into())));
    }

    #[test]
    fn test_properties_backfills_once() {
        let c = rooted_container(&sample_map());
        let props = c.properties();
        assert_eq!(props.len(), 3);
        let store = c.store.lock();
        let staged = store.staged.as_ref().unwrap();
        assert!(staged.contains_key("name"));
        assert!(staged.contains_key("address"));
    }

    #[test]
    fn test_adopted_map_becomes_subdocument() {
        let c = ContainerInner::new_detached();
        let mut inner = PropertyMap::new();
        inner.insert("street".into(), Value::String("1 milky way.".into()));
        c.set("address", Value::Dict(inner)).unwrap();

        let sd = c.get_subdocument("address").unwrap();
        assert_eq!(sd.get_string("street").as_deref(), Some("1 milky way."));
        // same instance on repeated reads
        assert!(Subdocument::ptr_eq(&sd, &c.get_subdocument("address").unwrap()));
    }

    #[test]
    fn test_list_reorder_keeps_instances() {
        let c = ContainerInner::new_detached();
        let a = Subdocument::new();
        a.set("n", 1i64).unwrap();
        let b = Subdocument::new();
        b.set("n", 2i64).unwrap();
        c.set(
            "items",
            Value::Array(vec![a.clone().into(), b.clone().into()]),
        )
        .unwrap();

        c.set("items", Value::Array(vec![b.clone().into(), a.clone().into()]))
            .unwrap();
        let items = c.get_array("items").unwrap();
        assert!(Subdocument::ptr_eq(&items[0].as_subdocument().unwrap(), &b));
        assert!(Subdocument::ptr_eq(&items[1].as_subdocument().unwrap(), &a));

        // shrinking the list invalidates the dropped instance only
        c.set("items", Value::Array(vec![b.clone().into()])).unwrap();
        assert_eq!(b.get_long("n"), 2);
        assert!(a.properties().is_empty());
    }
}
