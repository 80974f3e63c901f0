//! MetadataProjector: live, incrementally updated views over the metadata store.
//!
//! The projector subscribes to the store's change stream and republishes
//! derived values through `tokio::sync::watch` channels:
//! - all document ids, in store order
//! - per-document merged metadata records
//! - the trash / non-trash partition
//! - a cross-document index of one field
//!
//! Per-document lookups go through a position cache: the last index an id was
//! found at is validated in O(1) against the store and a full scan only runs
//! on a miss. Inserts, deletes and batched reorders simply fail validation and
//! fall back to the scan, which refreshes the cache.

use crate::events::Subscription;
use crate::record::{merge_formats, DocumentMetadataRecord, RawFields, FIELD_TRASH};
use crate::store::{find_index, MetaStore, MetaTxn, StoreError};
use crate::DocId;

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Document record not found: {0}")]
    NotFound(DocId),

    #[error("Document record already exists: {0}")]
    AlreadyExists(DocId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RecordError>;

/// Counters for the position cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub cache_hits: u64,
    pub full_scans: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    full_scans: AtomicU64,
}

type MetaSender = watch::Sender<Option<DocumentMetadataRecord>>;
type FieldIndex = BTreeMap<DocId, Value>;

#[derive(Default)]
struct ProjectorState {
    /// Last known index per looked-up id
    positions: HashMap<DocId, usize>,
    ids: Option<watch::Sender<Vec<DocId>>>,
    trash: Option<watch::Sender<Vec<DocId>>>,
    non_trash: Option<watch::Sender<Vec<DocId>>>,
    metas: HashMap<DocId, MetaSender>,
    fields: HashMap<String, watch::Sender<FieldIndex>>,
}

struct ProjectorCore {
    store: Arc<dyn MetaStore>,
    state: Mutex<ProjectorState>,
    counters: Counters,
}

/// One merged row of a full pass.
struct Row {
    id: DocId,
    fields: RawFields,
}

impl ProjectorCore {
    fn state(&self) -> MutexGuard<'_, ProjectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn locate(&self, state: &mut ProjectorState, id: &DocId) -> Option<usize> {
        if let Some(&index) = state.positions.get(id) {
            if self.store.id_at(index).as_ref() == Some(id) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Some(index);
            }
        }

        self.counters.full_scans.fetch_add(1, Ordering::Relaxed);
        let found = (0..self.store.len()).find(|&i| self.store.id_at(i).as_ref() == Some(id));
        match found {
            Some(index) => {
                state.positions.insert(id.clone(), index);
            }
            None => {
                state.positions.remove(id);
            }
        }
        found
    }

    fn merged_at(&self, index: usize, id: &DocId) -> RawFields {
        let legacy = self.store.entry_at(index);
        let newer = self.store.properties(id);
        merge_formats(legacy.as_ref(), newer.as_ref())
    }

    fn read_meta(&self, state: &mut ProjectorState, id: &DocId) -> Option<DocumentMetadataRecord> {
        let index = self.locate(state, id)?;
        let fields = self.merged_at(index, id);
        Some(DocumentMetadataRecord::from_fields(id.clone(), &fields))
    }

    fn scan_ids(&self) -> Vec<DocId> {
        (0..self.store.len())
            .filter_map(|i| self.store.id_at(i))
            .collect()
    }

    fn scan_rows(&self) -> Vec<Row> {
        (0..self.store.len())
            .filter_map(|i| {
                let id = self.store.id_at(i)?;
                let fields = self.merged_at(i, &id);
                Some(Row { id, fields })
            })
            .collect()
    }

    /// Recompute every view that still has receivers.
    fn refresh(&self) {
        let mut guard = self.state();
        let state = &mut *guard;

        state.metas.retain(|_, tx| !tx.is_closed());
        state.fields.retain(|_, tx| !tx.is_closed());
        for slot in [&mut state.ids, &mut state.trash, &mut state.non_trash] {
            if slot.as_ref().is_some_and(|tx| tx.is_closed()) {
                *slot = None;
            }
        }

        let watched: Vec<DocId> = state.metas.keys().cloned().collect();
        for id in watched {
            let meta = self.read_meta(state, &id);
            if let Some(tx) = state.metas.get(&id) {
                publish(tx, meta);
            }
        }

        if let Some(tx) = &state.ids {
            publish(tx, self.scan_ids());
        }

        let needs_rows =
            state.trash.is_some() || state.non_trash.is_some() || !state.fields.is_empty();
        if needs_rows {
            let rows = self.scan_rows();
            let (trash, non_trash) = partition(&rows);
            if let Some(tx) = &state.trash {
                publish(tx, trash);
            }
            if let Some(tx) = &state.non_trash {
                publish(tx, non_trash);
            }
            for (field, tx) in &state.fields {
                publish(tx, field_index(&rows, field));
            }
        }
    }
}

/// Send only when the value actually changed.
fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

fn is_trashed(fields: &RawFields) -> bool {
    fields
        .get(FIELD_TRASH)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn partition(rows: &[Row]) -> (Vec<DocId>, Vec<DocId>) {
    let mut trash = Vec::new();
    let mut non_trash = Vec::new();
    for row in rows {
        if is_trashed(&row.fields) {
            trash.push(row.id.clone());
        } else {
            non_trash.push(row.id.clone());
        }
    }
    (trash, non_trash)
}

fn field_index(rows: &[Row], field: &str) -> FieldIndex {
    rows.iter()
        .filter_map(|row| match row.fields.get(field) {
            Some(value) if !value.is_null() => Some((row.id.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

/// Derived metadata views. Cheap to clone.
#[derive(Clone)]
pub struct MetadataProjector {
    core: Arc<ProjectorCore>,
    _subscription: Arc<Subscription>,
}

impl MetadataProjector {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        let core = Arc::new(ProjectorCore {
            store: Arc::clone(&store),
            state: Mutex::new(ProjectorState::default()),
            counters: Counters::default(),
        });
        // Weak: the store owns the listener, the listener must not own the core
        let weak: Weak<ProjectorCore> = Arc::downgrade(&core);
        let subscription = store.subscribe(Box::new(move |_change| {
            if let Some(core) = weak.upgrade() {
                core.refresh();
            }
        }));
        Self {
            core,
            _subscription: Arc::new(subscription),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.core.store
    }

    /// Index of the entry for `id`, using the position cache.
    pub fn locate(&self, id: &DocId) -> Option<usize> {
        let mut state = self.core.state();
        self.core.locate(&mut state, id)
    }

    pub fn exists(&self, id: &DocId) -> bool {
        self.locate(id).is_some()
    }

    /// Current merged metadata for `id`.
    pub fn meta(&self, id: &DocId) -> Option<DocumentMetadataRecord> {
        let mut state = self.core.state();
        self.core.read_meta(&mut state, id)
    }

    /// Live record accessor for one document.
    pub fn record(&self, id: &DocId) -> Option<DocRecord> {
        self.exists(id).then(|| DocRecord {
            id: id.clone(),
            projector: self.clone(),
        })
    }

    pub fn ids(&self) -> Vec<DocId> {
        self.core.scan_ids()
    }

    pub fn trash_ids(&self) -> Vec<DocId> {
        partition(&self.core.scan_rows()).0
    }

    pub fn non_trash_ids(&self) -> Vec<DocId> {
        partition(&self.core.scan_rows()).1
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            cache_hits: self.core.counters.cache_hits.load(Ordering::Relaxed),
            full_scans: self.core.counters.full_scans.load(Ordering::Relaxed),
        }
    }

    /// All ids, republished when membership or order changes.
    pub fn watch_ids(&self) -> watch::Receiver<Vec<DocId>> {
        let mut state = self.core.state();
        if let Some(tx) = &state.ids {
            return tx.subscribe();
        }
        let (tx, rx) = watch::channel(self.core.scan_ids());
        state.ids = Some(tx);
        rx
    }

    /// Merged metadata of one document; `None` once the entry disappears.
    pub fn watch_meta(&self, id: &DocId) -> watch::Receiver<Option<DocumentMetadataRecord>> {
        let mut state = self.core.state();
        if let Some(tx) = state.metas.get(id) {
            return tx.subscribe();
        }
        let current = self.core.read_meta(&mut state, id);
        let (tx, rx) = watch::channel(current);
        state.metas.insert(id.clone(), tx);
        rx
    }

    pub fn watch_trash_ids(&self) -> watch::Receiver<Vec<DocId>> {
        self.watch_partition(true)
    }

    pub fn watch_non_trash_ids(&self) -> watch::Receiver<Vec<DocId>> {
        self.watch_partition(false)
    }

    fn watch_partition(&self, trashed: bool) -> watch::Receiver<Vec<DocId>> {
        let mut state = self.core.state();
        let slot = if trashed {
            &mut state.trash
        } else {
            &mut state.non_trash
        };
        if let Some(tx) = slot.as_ref() {
            return tx.subscribe();
        }
        let (trash, non_trash) = partition(&self.core.scan_rows());
        let (tx, rx) = watch::channel(if trashed { trash } else { non_trash });
        *slot = Some(tx);
        rx
    }

    /// Cross-document index of one merged field (e.g. `tags`), without
    /// opening any document. Documents where the field is null are omitted.
    pub fn watch_field(&self, field: &str) -> watch::Receiver<BTreeMap<DocId, Value>> {
        let mut state = self.core.state();
        if let Some(tx) = state.fields.get(field) {
            return tx.subscribe();
        }
        let (tx, rx) = watch::channel(field_index(&self.core.scan_rows(), field));
        state.fields.insert(field.to_string(), tx);
        rx
    }

    /// Insert a new record (legacy entry + properties) in one transaction.
    pub fn insert_record(&self, record: &DocumentMetadataRecord) -> Result<()> {
        let id = record.id.clone();
        let legacy = record.legacy_fields();
        let properties = record.property_fields();
        let mut duplicate = false;

        self.core.store.transact(&mut |txn: &mut dyn MetaTxn| {
            if find_index(txn, &id, None).is_some() {
                duplicate = true;
                return Ok(());
            }
            let end = txn.len();
            txn.insert_entry(end, &legacy)?;
            for (key, value) in &properties {
                txn.set_property(&id, key, value.clone())?;
            }
            Ok(())
        })?;

        if duplicate {
            return Err(RecordError::AlreadyExists(id));
        }
        debug!("Inserted metadata record {}", id);
        Ok(())
    }
}

/// Write access to one document's metadata.
#[derive(Clone)]
pub struct DocRecord {
    id: DocId,
    projector: MetadataProjector,
}

impl DocRecord {
    pub fn id(&self) -> &DocId {
        &self.id
    }

    pub fn meta(&self) -> Option<DocumentMetadataRecord> {
        self.projector.meta(&self.id)
    }

    pub fn watch(&self) -> watch::Receiver<Option<DocumentMetadataRecord>> {
        self.projector.watch_meta(&self.id)
    }

    /// Newer-format properties as stored, without the legacy merge.
    pub fn properties(&self) -> RawFields {
        self.projector
            .store()
            .properties(&self.id)
            .unwrap_or_default()
    }

    /// Write legacy fields and newer-format properties in one transaction.
    pub fn update(&self, fields: &[(&str, Value)], properties: &[(&str, Value)]) -> Result<()> {
        let hint = self.projector.locate(&self.id);
        let id = &self.id;
        let mut missing = false;

        self.projector.store().transact(&mut |txn: &mut dyn MetaTxn| {
            let Some(index) = find_index(txn, id, hint) else {
                missing = true;
                return Ok(());
            };
            for (key, value) in fields {
                txn.set_field(index, key, value.clone())?;
            }
            for (key, value) in properties {
                txn.set_property(id, key, value.clone())?;
            }
            Ok(())
        })?;

        if missing {
            return Err(RecordError::NotFound(self.id.clone()));
        }
        Ok(())
    }

    pub fn set_fields(&self, fields: &[(&str, Value)]) -> Result<()> {
        self.update(fields, &[])
    }

    pub fn set_properties(&self, properties: &[(&str, Value)]) -> Result<()> {
        self.update(&[], properties)
    }
}
