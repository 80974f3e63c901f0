//! MetaStore: the shared replicated structure holding document metadata.
//!
//! The store is only ever used through three capabilities: snapshot reads,
//! transactional writes and a change stream. `LoroMetaStore` implements it on
//! a single Loro document with:
//! - `pages`: LoroMovableList of LoroMaps, the legacy ordered entries
//! - `docProperties`: LoroMap of per-document LoroMaps, the newer format
//!
//! Local transactions and imported remote updates both notify subscribers
//! after they have been applied.

use crate::events::{EventBus, Subscription};
use crate::record::{RawFields, FIELD_ID};
use crate::DocId;

use loro::{Container, ExportMode, LoroDoc, LoroMap, LoroMovableList, LoroValue, ValueOrContainer};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const PAGES: &str = "pages";
const DOC_PROPERTIES: &str = "docProperties";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Index {index} out of bounds (len {len})")]
    OutOfBounds { index: usize, len: usize },

    #[error("Entry at {0} is not a map")]
    MalformedEntry(usize),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification published after a change has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub origin: ChangeOrigin,
}

/// Write access inside one transaction.
///
/// Indexes refer to the legacy ordered entry list.
pub trait MetaTxn {
    fn len(&self) -> usize;

    fn id_at(&self, index: usize) -> Option<DocId>;

    fn insert_entry(&mut self, index: usize, fields: &RawFields) -> Result<()>;

    /// Set one field of an entry; `Value::Null` deletes the field.
    fn set_field(&mut self, index: usize, key: &str, value: Value) -> Result<()>;

    fn remove_entry(&mut self, index: usize) -> Result<()>;

    fn move_entry(&mut self, from: usize, to: usize) -> Result<()>;

    /// Set one newer-format property; `Value::Null` deletes it.
    fn set_property(&mut self, id: &DocId, key: &str, value: Value) -> Result<()>;
}

/// Find an entry by id inside a transaction, trying `hint` first.
pub fn find_index(txn: &dyn MetaTxn, id: &DocId, hint: Option<usize>) -> Option<usize> {
    if let Some(index) = hint {
        if txn.id_at(index).as_ref() == Some(id) {
            return Some(index);
        }
    }
    (0..txn.len()).find(|&i| txn.id_at(i).as_ref() == Some(id))
}

/// Shared metadata structure.
pub trait MetaStore: Send + Sync {
    /// Number of legacy entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the entry at `index`, if it has one.
    fn id_at(&self, index: usize) -> Option<DocId>;

    /// Legacy fields of the entry at `index`.
    fn entry_at(&self, index: usize) -> Option<RawFields>;

    /// Newer-format properties of a document.
    fn properties(&self, id: &DocId) -> Option<RawFields>;

    /// Run `f` as one transaction; subscribers are notified once afterwards.
    fn transact(&self, f: &mut dyn FnMut(&mut dyn MetaTxn) -> Result<()>) -> Result<()>;

    fn subscribe(&self, listener: Box<dyn Fn(&StoreChange) + Send + Sync>) -> Subscription;
}

/// Loro-backed metadata store.
pub struct LoroMetaStore {
    doc: LoroDoc,
    pages: LoroMovableList,
    properties: LoroMap,
    /// Serializes transactions so notifications follow commit order
    txn_lock: Mutex<()>,
    changes: Arc<EventBus<StoreChange>>,
}

impl Default for LoroMetaStore {
    fn default() -> Self {
        Self::from_doc(LoroDoc::new())
    }
}

impl LoroMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose local operations carry `peer_id`.
    pub fn with_peer_id(peer_id: u64) -> Result<Self> {
        let doc = LoroDoc::new();
        // Set peer ID before any operations for consistent version vectors
        doc.set_peer_id(peer_id)
            .map_err(|e| StoreError::Loro(e.to_string()))?;
        Ok(Self::from_doc(doc))
    }

    fn from_doc(doc: LoroDoc) -> Self {
        let pages = doc.get_movable_list(PAGES);
        let properties = doc.get_map(DOC_PROPERTIES);
        Self {
            doc,
            pages,
            properties,
            txn_lock: Mutex::new(()),
            changes: Arc::new(EventBus::new()),
        }
    }

    /// Export full snapshot
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| StoreError::Loro(e.to_string()))
    }

    /// Apply updates from another replica and notify subscribers.
    pub fn import(&self, data: &[u8]) -> Result<()> {
        {
            let _guard = self.txn_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.doc
                .import(data)
                .map_err(|e| StoreError::Loro(e.to_string()))?;
        }
        tracing::debug!("Imported {} bytes of remote metadata", data.len());
        self.changes.emit(StoreChange {
            origin: ChangeOrigin::Remote,
        });
        Ok(())
    }

    fn entry_map(&self, index: usize) -> Option<LoroMap> {
        match self.pages.get(index)? {
            ValueOrContainer::Container(Container::Map(map)) => Some(map),
            _ => None,
        }
    }
}

fn map_string(map: &LoroMap, key: &str) -> Option<String> {
    match map.get(key)? {
        ValueOrContainer::Value(LoroValue::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn map_fields(map: &LoroMap) -> RawFields {
    match loro_value_to_json(&map.get_deep_value()) {
        Value::Object(fields) => fields,
        _ => RawFields::new(),
    }
}

fn write_field(map: &LoroMap, key: &str, value: Value) -> Result<()> {
    if value.is_null() {
        if map.get(key).is_some() {
            map.delete(key)
                .map_err(|e| StoreError::Loro(e.to_string()))?;
        }
        return Ok(());
    }
    map.insert(key, value)
        .map_err(|e| StoreError::Loro(e.to_string()))
}

impl MetaStore for LoroMetaStore {
    fn len(&self) -> usize {
        self.pages.len()
    }

    fn id_at(&self, index: usize) -> Option<DocId> {
        let map = self.entry_map(index)?;
        map_string(&map, FIELD_ID)?.parse().ok()
    }

    fn entry_at(&self, index: usize) -> Option<RawFields> {
        self.entry_map(index).map(|map| map_fields(&map))
    }

    fn properties(&self, id: &DocId) -> Option<RawFields> {
        match self.properties.get(id.as_str())? {
            ValueOrContainer::Container(Container::Map(map)) => Some(map_fields(&map)),
            _ => None,
        }
    }

    fn transact(&self, f: &mut dyn FnMut(&mut dyn MetaTxn) -> Result<()>) -> Result<()> {
        let result = {
            let _guard = self.txn_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut txn = LoroTxn { store: self };
            let result = f(&mut txn);
            // Loro has no rollback: whatever was applied is committed together
            self.doc.commit();
            result
        };
        self.changes.emit(StoreChange {
            origin: ChangeOrigin::Local,
        });
        result
    }

    fn subscribe(&self, listener: Box<dyn Fn(&StoreChange) + Send + Sync>) -> Subscription {
        self.changes.subscribe(move |change| listener(change))
    }
}

struct LoroTxn<'a> {
    store: &'a LoroMetaStore,
}

impl LoroTxn<'_> {
    fn entry(&self, index: usize) -> Result<LoroMap> {
        let len = self.store.pages.len();
        if index >= len {
            return Err(StoreError::OutOfBounds { index, len });
        }
        self.store
            .entry_map(index)
            .ok_or(StoreError::MalformedEntry(index))
    }
}

impl MetaTxn for LoroTxn<'_> {
    fn len(&self) -> usize {
        self.store.pages.len()
    }

    fn id_at(&self, index: usize) -> Option<DocId> {
        self.store.id_at(index)
    }

    fn insert_entry(&mut self, index: usize, fields: &RawFields) -> Result<()> {
        let len = self.store.pages.len();
        if index > len {
            return Err(StoreError::OutOfBounds { index, len });
        }
        let map = self
            .store
            .pages
            .insert_container(index, LoroMap::new())
            .map_err(|e| StoreError::Loro(e.to_string()))?;
        for (key, value) in fields {
            write_field(&map, key, value.clone())?;
        }
        Ok(())
    }

    fn set_field(&mut self, index: usize, key: &str, value: Value) -> Result<()> {
        let map = self.entry(index)?;
        write_field(&map, key, value)
    }

    fn remove_entry(&mut self, index: usize) -> Result<()> {
        let len = self.store.pages.len();
        if index >= len {
            return Err(StoreError::OutOfBounds { index, len });
        }
        self.store
            .pages
            .delete(index, 1)
            .map_err(|e| StoreError::Loro(e.to_string()))
    }

    fn move_entry(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.store.pages.len();
        if from >= len || to >= len {
            return Err(StoreError::OutOfBounds {
                index: from.max(to),
                len,
            });
        }
        if from == to {
            return Ok(());
        }
        self.store
            .pages
            .mov(from, to)
            .map_err(|e| StoreError::Loro(e.to_string()))
    }

    fn set_property(&mut self, id: &DocId, key: &str, value: Value) -> Result<()> {
        let properties = &self.store.properties;
        let map = match properties.get(id.as_str()) {
            Some(ValueOrContainer::Container(Container::Map(map))) => map,
            _ => properties
                .insert_container(id.as_str(), LoroMap::new())
                .map_err(|e| StoreError::Loro(e.to_string()))?,
        };
        write_field(&map, key, value)
    }
}

/// Convert LoroValue to serde_json::Value
pub(crate) fn loro_value_to_json(value: &LoroValue) -> Value {
    match value {
        LoroValue::Null => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::I64(n) => serde_json::json!(*n),
        LoroValue::Double(n) => serde_json::json!(*n),
        LoroValue::String(s) => Value::String(s.to_string()),
        LoroValue::List(arr) => Value::Array(arr.iter().map(loro_value_to_json).collect()),
        LoroValue::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), loro_value_to_json(v)))
                .collect(),
        ),
        _ => Value::Null, // Binary and container references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(s: &str) -> DocId {
        s.parse().unwrap()
    }

    fn entry(doc: &str, title: &str) -> RawFields {
        json!({ "id": doc, "title": title, "tags": ["a", "b"] })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_insert_and_read_entries() {
        let store = LoroMetaStore::new();
        store
            .transact(&mut |txn| {
                txn.insert_entry(0, &entry("a", "A"))?;
                txn.insert_entry(1, &entry("b", "B"))
            })
            .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.id_at(1), Some(id("b")));
        let fields = store.entry_at(0).unwrap();
        assert_eq!(fields["title"], json!("A"));
        assert_eq!(fields["tags"], json!(["a", "b"]));
        assert!(store.id_at(2).is_none());
    }

    #[test]
    fn test_set_field_null_deletes() {
        let store = LoroMetaStore::new();
        store
            .transact(&mut |txn| {
                txn.insert_entry(0, &entry("a", "A"))?;
                txn.set_field(0, "trashDate", json!(5))?;
                txn.set_field(0, "trashDate", Value::Null)
            })
            .unwrap();
        assert!(!store.entry_at(0).unwrap().contains_key("trashDate"));
    }

    #[test]
    fn test_move_and_remove() {
        let store = LoroMetaStore::new();
        store
            .transact(&mut |txn| {
                txn.insert_entry(0, &entry("a", "A"))?;
                txn.insert_entry(1, &entry("b", "B"))?;
                txn.insert_entry(2, &entry("c", "C"))?;
                txn.move_entry(0, 2)
            })
            .unwrap();
        let order: Vec<_> = (0..store.len()).filter_map(|i| store.id_at(i)).collect();
        assert_eq!(order, vec![id("b"), id("c"), id("a")]);

        store.transact(&mut |txn| txn.remove_entry(0)).unwrap();
        assert_eq!(store.id_at(0), Some(id("c")));
    }

    #[test]
    fn test_out_of_bounds_is_reported() {
        let store = LoroMetaStore::new();
        let err = store
            .transact(&mut |txn| txn.set_field(3, "title", json!("x")))
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfBounds { index: 3, len: 0 }));
    }

    #[test]
    fn test_properties_are_per_document() {
        let store = LoroMetaStore::new();
        store
            .transact(&mut |txn| txn.set_property(&id("a"), "primaryMode", json!("edgeless")))
            .unwrap();
        assert_eq!(
            store.properties(&id("a")).unwrap()["primaryMode"],
            json!("edgeless")
        );
        assert!(store.properties(&id("b")).is_none());
    }

    #[test]
    fn test_later_property_writes_reuse_the_map() {
        let store = LoroMetaStore::new();
        store
            .transact(&mut |txn| txn.set_property(&id("a"), "primaryMode", json!("edgeless")))
            .unwrap();
        store
            .transact(&mut |txn| txn.set_property(&id("a"), "icon", json!("star")))
            .unwrap();

        let props = store.properties(&id("a")).unwrap();
        assert_eq!(props["primaryMode"], json!("edgeless"));
        assert_eq!(props["icon"], json!("star"));
    }

    #[test]
    fn test_subscribers_notified_once_per_transaction_and_import() {
        let local = LoroMetaStore::with_peer_id(1).unwrap();
        let remote = LoroMetaStore::with_peer_id(2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = remote.subscribe(Box::new(move |change| {
            assert_eq!(change.origin, ChangeOrigin::Remote);
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        local
            .transact(&mut |txn| {
                txn.insert_entry(0, &entry("a", "A"))?;
                txn.insert_entry(1, &entry("b", "B"))
            })
            .unwrap();
        remote.import(&local.export_snapshot().unwrap()).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(remote.id_at(1), Some(id("b")));
    }

    #[test]
    fn test_find_index_uses_hint_then_scans() {
        let store = LoroMetaStore::new();
        store
            .transact(&mut |txn| {
                txn.insert_entry(0, &entry("a", "A"))?;
                txn.insert_entry(1, &entry("b", "B"))?;
                assert_eq!(find_index(txn, &id("b"), Some(1)), Some(1));
                assert_eq!(find_index(txn, &id("b"), Some(0)), Some(1));
                assert_eq!(find_index(txn, &id("z"), None), None);
                Ok(())
            })
            .unwrap();
    }
}
