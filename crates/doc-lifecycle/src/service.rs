//! DocumentLifecycleService: create, open, share and tear down documents.
//!
//! Open documents are pooled: every `open` of the same id returns a lease on
//! the same `DocumentHandle`, and the handle is disposed once the last lease
//! is released.

use crate::config::LifecycleConfig;
use crate::content::{
    seed, BlockSnapshot, ContentError, ContentProvider, FLAVOUR_LINKED_DOC,
    FLAVOUR_NOTE, PROP_PAGE_ID,
};
use crate::events::{DocEvent, EventBus, Subscription};
use crate::handle::{self, DocumentHandle, HandleError};
use crate::hooks::{CreateHook, HookRegistry};
use crate::pool::{ObjectPool, PoolError, PoolOptions, PoolRef};
use crate::projector::{DocRecord, MetadataProjector, RecordError};
use crate::record::{
    now_millis, DocumentMetadataRecord, PrimaryMode, TagId, FIELD_ID, FIELD_PRIMARY_MODE,
    LEGACY_FIELDS,
};
use crate::scheduler::{PriorityGuard, SyncPhase, SyncScheduler, WaitOutcome};
use crate::store::{MetaStore, StoreError};
use crate::transport::ReplicationTransport;
use crate::DocId;

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which half of a document could not be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Record,
    Content,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Record => f.write_str("record"),
            Missing::Content => f.write_str("content"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Document {id} not found ({missing} missing)")]
    NotFound { id: DocId, missing: Missing },

    #[error("Document {id} is not ready (phase: {phase})")]
    NotReady { id: DocId, phase: SyncPhase },

    #[error("Document {0} already exists")]
    AlreadyExists(DocId),

    #[error("Waiting for document {0} was aborted")]
    Aborted(DocId),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<RecordError> for LifecycleError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::NotFound(id) => LifecycleError::NotFound {
                id,
                missing: Missing::Record,
            },
            RecordError::AlreadyExists(id) => LifecycleError::AlreadyExists(id),
            RecordError::Store(e) => LifecycleError::Store(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Options for `create_doc`. Everything is optional.
#[derive(Debug, Clone, Default)]
pub struct CreateDocOptions {
    /// Use this id instead of allocating one.
    pub id: Option<DocId>,
    pub title: Option<String>,
    pub primary_mode: Option<PrimaryMode>,
    pub tags: BTreeSet<TagId>,
    /// User-defined properties. Built-in field names are ignored.
    pub properties: BTreeMap<String, Value>,
    /// Leave the content empty instead of seeding the initial blocks.
    pub skip_init: bool,
}

impl CreateDocOptions {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

type HandlePool = ObjectPool<DocId, Arc<DocumentHandle>>;
type HandleRef = PoolRef<DocId, Arc<DocumentHandle>>;

/// A caller's share of an open document.
///
/// Dropping the lease (or calling `release`) gives the share back; the
/// handle is disposed when no lease is left.
pub struct DocLease {
    entry: HandleRef,
    _priority: PriorityGuard,
}

impl DocLease {
    pub fn handle(&self) -> &Arc<DocumentHandle> {
        self.entry.object()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Deref for DocLease {
    type Target = DocumentHandle;

    fn deref(&self) -> &DocumentHandle {
        self.entry.object()
    }
}

impl fmt::Debug for DocLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocLease")
            .field("id", self.entry.key())
            .finish()
    }
}

pub struct DocumentLifecycleService {
    pub(crate) projector: MetadataProjector,
    pub(crate) contents: Arc<dyn ContentProvider>,
    pub(crate) scheduler: SyncScheduler,
    pool: HandlePool,
    hooks: HookRegistry,
    pub(crate) events: Arc<EventBus<DocEvent>>,
    pub(crate) config: LifecycleConfig,
}

impl DocumentLifecycleService {
    pub fn new(
        store: Arc<dyn MetaStore>,
        contents: Arc<dyn ContentProvider>,
        transport: Arc<dyn ReplicationTransport>,
        config: LifecycleConfig,
    ) -> Self {
        let events: Arc<EventBus<DocEvent>> = Arc::new(EventBus::new());
        let pool = {
            let events = Arc::clone(&events);
            ObjectPool::new(PoolOptions::default().on_delete(
                move |id: &DocId, handle: Arc<DocumentHandle>| {
                    handle.dispose();
                    events.emit(DocEvent::Evicted { id: id.clone() });
                },
            ))
        };

        Self {
            projector: MetadataProjector::new(store),
            contents,
            scheduler: SyncScheduler::new(transport, &config),
            pool,
            hooks: HookRegistry::new(),
            events,
            config,
        }
    }

    pub fn projector(&self) -> &MetadataProjector {
        &self.projector
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn register_hook(&self, hook: Arc<dyn CreateHook>) {
        self.hooks.register(hook);
    }

    /// Subscribe to lifecycle events. Drop the subscription to stop.
    pub fn subscribe(&self, callback: impl Fn(&DocEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Dispose every pooled handle and stop syncing.
    pub fn shutdown(&self) {
        debug!("Shutting down with {} open documents", self.pool.len());
        self.pool.clear();
        self.scheduler.stop();
    }

    pub fn is_open(&self, id: &DocId) -> bool {
        self.pool.contains(id)
    }

    /// Number of outstanding leases on `id`.
    pub fn lease_count(&self, id: &DocId) -> usize {
        self.pool.ref_count(id).unwrap_or(0)
    }

    /// Create a document: its content, then the record in one atomic insert.
    /// A failed insert discards the new content again.
    pub fn create_doc(&self, options: CreateDocOptions) -> Result<DocumentMetadataRecord> {
        let mut options = options;
        self.hooks.before_create(&mut options);

        let id = match options.id.take() {
            Some(id) if self.projector.exists(&id) => {
                return Err(LifecycleError::AlreadyExists(id));
            }
            Some(id) => id,
            None => DocId::generate(),
        };

        let now = now_millis();
        let mut record = DocumentMetadataRecord::empty(id.clone());
        record.title = options.title.clone().unwrap_or_default();
        record.create_date = now;
        record.tags = std::mem::take(&mut options.tags);
        record.primary_mode = options.primary_mode.unwrap_or_default();
        for (key, value) in std::mem::take(&mut options.properties) {
            if is_builtin_field(&key) {
                warn!(doc_id = %id, "Ignoring built-in field {} in create options", key);
                continue;
            }
            record.custom_properties.insert(key, value);
        }

        let content = self.contents.create(&id)?;
        if let Err(e) = self.projector.insert_record(&record) {
            self.contents.discard(&id);
            return Err(e.into());
        }
        if !options.skip_init {
            let title = record.title.clone();
            content.transact(&mut |txn| seed(txn, &title))?;
        }

        self.hooks.after_create(&record, content.as_ref());
        info!(doc_id = %id, "Created document");
        self.events.emit(DocEvent::Created {
            id: id.clone(),
            timestamp: now,
        });
        Ok(self.projector.meta(&id).unwrap_or(record))
    }

    /// Open a document, sharing the handle with every other open lease.
    pub fn open(&self, id: &DocId) -> Result<DocLease> {
        let record = self
            .projector
            .record(id)
            .ok_or_else(|| LifecycleError::NotFound {
                id: id.clone(),
                missing: Missing::Record,
            })?;
        let priority = self.scheduler.add_priority(id, self.config.open_priority);

        if let Some(entry) = self.pool.get(id) {
            return Ok(DocLease {
                entry,
                _priority: priority,
            });
        }

        let content = self
            .contents
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound {
                id: id.clone(),
                missing: Missing::Content,
            })?;
        self.scheduler.connect(id);
        if !content.is_loaded() {
            if !self.scheduler.state(id).loaded {
                return Err(LifecycleError::NotReady {
                    id: id.clone(),
                    phase: self.scheduler.phase(id),
                });
            }
            content.load()?;
        }

        let handle = DocumentHandle::builder()
            .doc_id(id.clone())
            .record(record)
            .content(content)
            .scheduler(self.scheduler.clone())
            .config(self.config.clone())
            .build()?;

        let entry = match self.pool.put(id.clone(), Arc::new(handle)) {
            Ok(entry) => entry,
            // Lost a race with another open; use the winner's handle
            Err(e) => self.pool.get(id).ok_or(e)?,
        };
        debug!(doc_id = %id, "Opened document");
        Ok(DocLease {
            entry,
            _priority: priority,
        })
    }

    /// Wait (bounded by the configured ready timeout) until the document can
    /// be loaded, then open it.
    pub async fn open_when_ready(
        &self,
        id: &DocId,
        abort: Option<&CancellationToken>,
    ) -> Result<DocLease> {
        if !self.projector.exists(id) {
            return Err(LifecycleError::NotFound {
                id: id.clone(),
                missing: Missing::Record,
            });
        }
        let available = self.pool.contains(id)
            || self.contents.get(id).is_some_and(|c| c.is_loaded());
        if available {
            return self.open(id);
        }

        let _priority = self.scheduler.add_priority(id, self.config.open_priority);
        self.scheduler.connect(id);
        match self.scheduler.wait_for_ready(id, None, abort).await {
            WaitOutcome::Aborted => Err(LifecycleError::Aborted(id.clone())),
            WaitOutcome::Reached | WaitOutcome::TimedOut => self.open(id),
        }
    }

    /// Rename a document in its metadata and content.
    pub fn change_doc_title(&self, id: &DocId, title: &str) -> Result<()> {
        let lease = self.open(id)?;
        lease.rename(title)?;
        Ok(())
    }

    pub fn move_to_trash(&self, id: &DocId) -> Result<()> {
        let record = self.require_record(id)?;
        handle::write_trash(&record, true)?;
        info!(doc_id = %id, "Moved document to trash");
        self.events.emit(DocEvent::Trashed { id: id.clone() });
        Ok(())
    }

    pub fn restore_from_trash(&self, id: &DocId) -> Result<()> {
        let record = self.require_record(id)?;
        handle::write_trash(&record, false)?;
        info!(doc_id = %id, "Restored document from trash");
        self.events.emit(DocEvent::Restored { id: id.clone() });
        Ok(())
    }

    /// Append a reference to `linked` inside `target`.
    pub fn add_linked_doc(&self, target: &DocId, linked: &DocId) -> Result<()> {
        self.require_record(linked)?;
        let lease = self.open(target)?;
        let content = lease.content();
        let parent = content
            .blocks()
            .iter()
            .find_map(|root| root.find_flavour(FLAVOUR_NOTE).map(|b| b.id.clone()));
        let block = BlockSnapshot::new(FLAVOUR_LINKED_DOC).with_prop(PROP_PAGE_ID, linked.as_str());
        content.transact(&mut |txn| txn.insert_tree(parent.as_deref(), &block))?;
        debug!(doc_id = %target, linked = %linked, "Added linked doc");
        Ok(())
    }

    /// Remove every reference to `linked` from `target`. Returns how many
    /// were removed.
    pub fn remove_linked_doc(&self, target: &DocId, linked: &DocId) -> Result<usize> {
        let lease = self.open(target)?;
        let content = lease.content();
        let mut doomed = Vec::new();
        for root in content.blocks() {
            root.walk(&mut |block| {
                if links_to(block).as_ref() == Some(linked) {
                    doomed.push(block.id.clone());
                }
            });
        }
        if !doomed.is_empty() {
            content.transact(&mut |txn| {
                for block_id in &doomed {
                    txn.remove_block(block_id)?;
                }
                Ok(())
            })?;
        }
        Ok(doomed.len())
    }

    /// Documents referenced from `id`, in block order, without repeats.
    pub fn linked_docs(&self, id: &DocId) -> Result<Vec<DocId>> {
        let lease = self.open(id)?;
        let mut linked: Vec<DocId> = Vec::new();
        for root in lease.content().blocks() {
            root.walk(&mut |block| {
                if let Some(target) = links_to(block) {
                    if !linked.contains(&target) {
                        linked.push(target);
                    }
                }
            });
        }
        Ok(linked)
    }

    fn require_record(&self, id: &DocId) -> Result<DocRecord> {
        self.projector
            .record(id)
            .ok_or_else(|| LifecycleError::NotFound {
                id: id.clone(),
                missing: Missing::Record,
            })
    }
}

fn links_to(block: &BlockSnapshot) -> Option<DocId> {
    if block.flavour != FLAVOUR_LINKED_DOC {
        return None;
    }
    block.props.get(PROP_PAGE_ID)?.as_str()?.parse().ok()
}

fn is_builtin_field(key: &str) -> bool {
    key == FIELD_ID || key == FIELD_PRIMARY_MODE || LEGACY_FIELDS.contains(&key)
}

impl Drop for DocumentLifecycleService {
    fn drop(&mut self) {
        self.pool.clear();
    }
}
