//! DocumentHandle: one open document, its live record and its content.
//!
//! Handles are pooled by the lifecycle service and shared by every caller
//! that opens the same document. A handle is built through
//! `DocumentHandle::builder()`, which refuses to produce a handle missing any
//! of its parts.

use crate::config::LifecycleConfig;
use crate::content::{ContentError, DocContent};
use crate::events::Subscription;
use crate::projector::{DocRecord, RecordError};
use crate::record::{
    now_millis, tags_value, DocumentMetadataRecord, PrimaryMode, TagId, FIELD_ID,
    FIELD_PRIMARY_MODE, FIELD_TAGS, FIELD_TITLE, FIELD_TRASH, FIELD_TRASH_DATE,
    FIELD_UPDATED_DATE, LEGACY_FIELDS,
};
use crate::scheduler::{PriorityGuard, SyncPhase, SyncScheduler, WaitOutcome};
use crate::throttle::Throttle;
use crate::DocId;

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("DocumentHandle is missing {0}")]
    Missing(&'static str),

    #[error("Record {found} does not belong to document {expected}")]
    IdMismatch { expected: DocId, found: DocId },

    #[error("Property {0} cannot be set directly")]
    ReservedKey(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Content(#[from] ContentError),
}

pub type Result<T> = std::result::Result<T, HandleError>;

/// Builder for `DocumentHandle`. Every member except `config` is required.
#[derive(Default)]
pub struct DocumentHandleBuilder {
    doc_id: Option<DocId>,
    record: Option<DocRecord>,
    content: Option<Arc<dyn DocContent>>,
    scheduler: Option<SyncScheduler>,
    config: Option<LifecycleConfig>,
}

impl DocumentHandleBuilder {
    pub fn doc_id(mut self, doc_id: DocId) -> Self {
        self.doc_id = Some(doc_id);
        self
    }

    pub fn record(mut self, record: DocRecord) -> Self {
        self.record = Some(record);
        self
    }

    pub fn content(mut self, content: Arc<dyn DocContent>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn scheduler(mut self, scheduler: SyncScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<DocumentHandle> {
        let id = self.doc_id.ok_or(HandleError::Missing("doc_id"))?;
        let record = self.record.ok_or(HandleError::Missing("record"))?;
        let content = self.content.ok_or(HandleError::Missing("content"))?;
        let scheduler = self.scheduler.ok_or(HandleError::Missing("scheduler"))?;
        let config = self.config.unwrap_or_default();

        for found in [record.id(), content.id()] {
            if *found != id {
                return Err(HandleError::IdMismatch {
                    expected: id,
                    found: found.clone(),
                });
            }
        }

        let updated = {
            let record = record.clone();
            Arc::new(Throttle::new(config.updated_date_throttle(), move || {
                touch_updated_date(&record)
            }))
        };
        let listener = {
            let updated = Arc::clone(&updated);
            content.subscribe_local(Box::new(move |_| updated.call()))
        };

        debug!(doc_id = %id, "Built document handle");
        Ok(DocumentHandle {
            id,
            record,
            content,
            scheduler,
            config,
            updated,
            listener: Mutex::new(Some(listener)),
            disposed: AtomicBool::new(false),
        })
    }
}

fn touch_updated_date(record: &DocRecord) {
    let now = now_millis();
    if let Err(e) = record.set_fields(&[(FIELD_UPDATED_DATE, Value::from(now))]) {
        debug!(doc_id = %record.id(), "Skipping updatedDate write: {}", e);
    }
}

/// Set or clear the trash flag together with its date.
pub(crate) fn write_trash(record: &DocRecord, trash: bool) -> std::result::Result<(), RecordError> {
    let date = if trash {
        Value::from(now_millis())
    } else {
        Value::Null
    };
    record.set_fields(&[(FIELD_TRASH, Value::Bool(trash)), (FIELD_TRASH_DATE, date)])
}

/// An open document.
pub struct DocumentHandle {
    id: DocId,
    record: DocRecord,
    content: Arc<dyn DocContent>,
    scheduler: SyncScheduler,
    config: LifecycleConfig,
    /// Throttled `updatedDate` writer driven by local content transactions
    updated: Arc<Throttle>,
    listener: Mutex<Option<Subscription>>,
    disposed: AtomicBool,
}

impl DocumentHandle {
    pub fn builder() -> DocumentHandleBuilder {
        DocumentHandleBuilder::default()
    }

    pub fn id(&self) -> &DocId {
        &self.id
    }

    pub fn record(&self) -> &DocRecord {
        &self.record
    }

    pub fn content(&self) -> &Arc<dyn DocContent> {
        &self.content
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn meta(&self) -> Option<DocumentMetadataRecord> {
        self.record.meta()
    }

    fn current(&self) -> Result<DocumentMetadataRecord> {
        self.record
            .meta()
            .ok_or_else(|| RecordError::NotFound(self.id.clone()).into())
    }

    /// Rename the document in its metadata and its content.
    ///
    /// If the content write fails the metadata title is put back.
    pub fn rename(&self, title: &str) -> Result<()> {
        let previous = self.current()?.title;
        self.record
            .set_fields(&[(FIELD_TITLE, Value::from(title))])?;

        if let Err(e) = self.content.set_title(title) {
            warn!(doc_id = %self.id, "Content rename failed, restoring title: {}", e);
            if let Err(restore) = self
                .record
                .set_fields(&[(FIELD_TITLE, Value::from(previous))])
            {
                warn!(doc_id = %self.id, "Failed to restore title: {}", restore);
            }
            return Err(e.into());
        }
        debug!(doc_id = %self.id, "Renamed document");
        Ok(())
    }

    pub fn set_primary_mode(&self, mode: PrimaryMode) -> Result<()> {
        self.record
            .set_properties(&[(FIELD_PRIMARY_MODE, Value::from(mode.as_str()))])?;
        Ok(())
    }

    /// Write any metadata field except `id`, routed to the format that owns it.
    pub fn set_property(&self, key: &str, value: Value) -> Result<()> {
        if key == FIELD_ID {
            return Err(HandleError::ReservedKey(key.to_string()));
        }
        if LEGACY_FIELDS.contains(&key) {
            self.record.set_fields(&[(key, value)])?;
        } else {
            self.record.set_properties(&[(key, value)])?;
        }
        Ok(())
    }

    /// Write a user-defined property. Built-in fields are refused.
    pub fn set_custom_property(&self, key: &str, value: Value) -> Result<()> {
        if LEGACY_FIELDS.contains(&key) || key == FIELD_PRIMARY_MODE {
            return Err(HandleError::ReservedKey(key.to_string()));
        }
        self.record.set_properties(&[(key, value)])?;
        Ok(())
    }

    pub fn set_tags(&self, tags: impl IntoIterator<Item = TagId>) -> Result<()> {
        let tags: BTreeSet<TagId> = tags.into_iter().collect();
        self.record.set_fields(&[(FIELD_TAGS, tags_value(&tags))])?;
        Ok(())
    }

    /// Returns false if the tag was already present.
    pub fn add_tag(&self, tag: &str) -> Result<bool> {
        let mut tags = self.current()?.tags;
        if !tags.insert(tag.to_string()) {
            return Ok(false);
        }
        self.set_tags(tags)?;
        Ok(true)
    }

    /// Returns false if the tag was not present.
    pub fn remove_tag(&self, tag: &str) -> Result<bool> {
        let mut tags = self.current()?.tags;
        if !tags.remove(tag) {
            return Ok(false);
        }
        self.set_tags(tags)?;
        Ok(true)
    }

    pub fn move_to_trash(&self) -> Result<()> {
        write_trash(&self.record, true)?;
        Ok(())
    }

    pub fn restore_from_trash(&self) -> Result<()> {
        write_trash(&self.record, false)?;
        Ok(())
    }

    pub fn is_trashed(&self) -> bool {
        self.record.meta().is_some_and(|m| m.trash)
    }

    /// Raise this document's load priority while the guard lives.
    pub fn add_priority_load(&self, weight: i32) -> PriorityGuard {
        self.scheduler.add_priority(&self.id, weight)
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.scheduler.phase(&self.id)
    }

    /// Wait until the document is ready, bounded by the configured timeout.
    pub async fn wait_for_sync_ready(&self, abort: Option<&CancellationToken>) -> WaitOutcome {
        self.scheduler
            .wait_for_ready(&self.id, Some(self.config.ready_timeout()), abort)
            .await
    }

    /// Write a pending `updatedDate` now.
    pub fn flush_updated_date(&self) {
        self.updated.flush();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Flush pending writes and detach from the content. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.updated.dispose();
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(listener);
        debug!(doc_id = %self.id, "Disposed document handle");
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
