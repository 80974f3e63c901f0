//! Copying one document into another: duplicate and create-from-template.

use crate::content::{BlockSnapshot, ContentError, DocContent};
use crate::events::DocEvent;
use crate::record::{
    tags_value, DocumentMetadataRecord, FIELD_PRIMARY_MODE, FIELD_TAGS, FIELD_TITLE,
    IDENTITY_PROPERTIES,
};
use crate::service::{CreateDocOptions, DocumentLifecycleService, LifecycleError, Missing, Result};
use crate::DocId;

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Title for a copy of a document titled `title`.
///
/// `Notes` becomes `Notes(1)` and `Notes(3)` becomes `Notes(4)`.
pub fn next_duplicate_title(title: &str) -> String {
    if let Some(open) = title.strip_suffix(')').and_then(|rest| rest.rfind('(')) {
        let digits = &title[open + 1..title.len() - 1];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = digits.parse::<u64>() {
                return format!("{}({})", &title[..open], n.saturating_add(1));
            }
        }
    }
    format!("{title}(1)")
}

/// Copy of `blocks` where every block has a fresh id.
pub fn with_fresh_ids(blocks: &[BlockSnapshot]) -> Vec<BlockSnapshot> {
    blocks
        .iter()
        .map(|block| BlockSnapshot {
            id: Uuid::new_v4().simple().to_string(),
            flavour: block.flavour.clone(),
            props: block.props.clone(),
            children: with_fresh_ids(&block.children),
        })
        .collect()
}

/// Replace the content of `target` with a re-identified copy of `blocks`.
fn transplant(
    target: &dyn DocContent,
    blocks: &[BlockSnapshot],
    title: &str,
) -> std::result::Result<(), ContentError> {
    let fresh = with_fresh_ids(blocks);
    target.transact(&mut |txn| {
        txn.clear()?;
        for block in &fresh {
            txn.insert_tree(None, block)?;
        }
        txn.set_title(title)
    })
}

/// Properties of `source` that may be copied onto another document.
fn copyable_properties(source: &DocumentMetadataRecord) -> BTreeMap<String, Value> {
    source
        .custom_properties
        .iter()
        .filter(|(key, _)| !IDENTITY_PROPERTIES.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

impl DocumentLifecycleService {
    /// Copy `source` into `target`, or into a new document when `target` is
    /// `None`. Returns the id written to, or `None` when the source is in the
    /// trash.
    ///
    /// Waits (bounded) for the source to finish syncing first. A failed
    /// content copy is logged and leaves the target with metadata only.
    pub async fn duplicate(&self, source: &DocId, target: Option<&DocId>) -> Result<Option<DocId>> {
        let meta = self
            .projector
            .meta(source)
            .ok_or_else(|| LifecycleError::NotFound {
                id: source.clone(),
                missing: Missing::Record,
            })?;
        if meta.trash {
            warn!(source = %source, "Skipping duplicate of trashed document");
            return Ok(None);
        }

        {
            let _priority = self.scheduler.add_priority(source, self.config.open_priority);
            self.scheduler.connect(source);
            let outcome = self
                .scheduler
                .wait_for_synced(source, Some(self.config.duplicate_sync_timeout()), None)
                .await;
            if !outcome.is_reached() {
                warn!(source = %source, ?outcome, "Duplicating before source finished syncing");
            }
        }

        let title = next_duplicate_title(&meta.title);
        let properties = copyable_properties(&meta);
        let target = match target {
            Some(target) => {
                let record = self.projector.record(target).ok_or_else(|| {
                    LifecycleError::NotFound {
                        id: target.clone(),
                        missing: Missing::Record,
                    }
                })?;
                let mut newer: Vec<(&str, Value)> = vec![(
                    FIELD_PRIMARY_MODE,
                    Value::from(meta.primary_mode.as_str()),
                )];
                newer.extend(properties.iter().map(|(k, v)| (k.as_str(), v.clone())));
                record.update(
                    &[
                        (FIELD_TITLE, Value::from(title.as_str())),
                        (FIELD_TAGS, tags_value(&meta.tags)),
                    ],
                    &newer,
                )?;
                target.clone()
            }
            None => {
                let created = self.create_doc(CreateDocOptions {
                    id: None,
                    title: Some(title.clone()),
                    primary_mode: Some(meta.primary_mode),
                    tags: meta.tags.clone(),
                    properties,
                    skip_init: true,
                })?;
                created.id
            }
        };

        let complete = self.copy_content(source, &target, &title);
        info!(source = %source, target = %target, complete, "Duplicated document");
        self.events.emit(DocEvent::Duplicated {
            source: source.clone(),
            target: target.clone(),
            complete,
        });
        Ok(Some(target))
    }

    /// Create a new document whose content is a copy of `template_id`.
    ///
    /// The title comes from `options`, falling back to the template's own
    /// title without a copy suffix.
    pub fn create_from_template(
        &self,
        template_id: &DocId,
        options: CreateDocOptions,
    ) -> Result<DocumentMetadataRecord> {
        let template = self
            .projector
            .meta(template_id)
            .ok_or_else(|| LifecycleError::NotFound {
                id: template_id.clone(),
                missing: Missing::Record,
            })?;
        let blocks = self.open(template_id)?.content().blocks();

        let mut options = options;
        let title = options
            .title
            .get_or_insert_with(|| template.title.clone())
            .clone();
        options.primary_mode.get_or_insert(template.primary_mode);
        for (key, value) in copyable_properties(&template) {
            options.properties.entry(key).or_insert(value);
        }
        options.skip_init = true;

        let created = self.create_doc(options)?;
        let lease = self.open(&created.id)?;
        transplant(lease.content().as_ref(), &blocks, &title)?;
        info!(template = %template_id, doc_id = %created.id, "Created document from template");
        Ok(self.projector.meta(&created.id).unwrap_or(created))
    }

    /// Returns false if the content could not be copied.
    fn copy_content(&self, source: &DocId, target: &DocId, title: &str) -> bool {
        let result = self.open(source).and_then(|source_lease| {
            let blocks = source_lease.content().blocks();
            let target_lease = self.open(target)?;
            transplant(target_lease.content().as_ref(), &blocks, title)?;
            Ok(())
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(source = %source, target = %target, "Failed to copy content: {}", e);
                false
            }
        }
    }
}
