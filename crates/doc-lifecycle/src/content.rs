//! DocContent: the block tree of a single document.
//!
//! Rendering and editing live elsewhere; this crate only needs to load a
//! document, run transactions against it, read its title and enumerate its
//! blocks. `LoroContent` implements it on a Loro document with:
//! - `page`: LoroMap holding the document title
//! - `blocks`: LoroMovableList of LoroMaps `{id, flavour, parent?, props}`,
//!   parents always listed before their children

use crate::events::{EventBus, Subscription};
use crate::record::RawFields;
use crate::store::loro_value_to_json;
use crate::DocId;

use loro::{Container, ExportMode, LoroDoc, LoroMap, LoroMovableList, LoroValue, ValueOrContainer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

pub const FLAVOUR_PAGE: &str = "affine:page";
pub const FLAVOUR_SURFACE: &str = "affine:surface";
pub const FLAVOUR_NOTE: &str = "affine:note";
pub const FLAVOUR_PARAGRAPH: &str = "affine:paragraph";
pub const FLAVOUR_LINKED_DOC: &str = "affine:embed-linked-doc";

/// Prop of a linked-doc block naming the referenced document.
pub const PROP_PAGE_ID: &str = "pageId";

const PAGE: &str = "page";
const BLOCKS: &str = "blocks";
const TITLE: &str = "title";

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Content of {0} is not loaded")]
    NotLoaded(DocId),

    #[error("Content of {0} already exists")]
    AlreadyExists(DocId),

    #[error("Block {0} not found")]
    BlockNotFound(String),
}

pub type Result<T> = std::result::Result<T, ContentError>;

fn loro_err(e: impl std::fmt::Display) -> ContentError {
    ContentError::Loro(e.to_string())
}

/// One block and its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub id: String,
    pub flavour: String,
    #[serde(default)]
    pub props: RawFields,
    #[serde(default)]
    pub children: Vec<BlockSnapshot>,
}

impl BlockSnapshot {
    /// A block with a fresh id.
    pub fn new(flavour: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            flavour: flavour.to_string(),
            props: RawFields::new(),
            children: Vec::new(),
        }
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.props.insert(key.to_string(), value.into());
        self
    }

    pub fn with_child(mut self, child: BlockSnapshot) -> Self {
        self.children.push(child);
        self
    }

    /// Number of blocks in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(BlockSnapshot::count).sum::<usize>()
    }

    /// Visit this block and its descendants depth-first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a BlockSnapshot)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// First descendant (or self) with `flavour`.
    pub fn find_flavour(&self, flavour: &str) -> Option<&BlockSnapshot> {
        if self.flavour == flavour {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_flavour(flavour))
    }
}

/// Published after a local transaction has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub doc_id: DocId,
}

/// Write access inside one content transaction.
pub trait ContentTxn {
    fn set_title(&mut self, title: &str) -> Result<()>;

    /// Remove every block.
    fn clear(&mut self) -> Result<()>;

    /// Insert `block` and its subtree under `parent` (a root when `None`).
    fn insert_tree(&mut self, parent: Option<&str>, block: &BlockSnapshot) -> Result<()>;

    /// Set props of one block; `Value::Null` deletes the prop.
    fn update_props(&mut self, block_id: &str, props: &[(&str, Value)]) -> Result<()>;

    /// Remove a block and its subtree.
    fn remove_block(&mut self, block_id: &str) -> Result<()>;
}

/// Content of one document.
pub trait DocContent: Send + Sync {
    fn id(&self) -> &DocId;

    fn is_loaded(&self) -> bool;

    /// Load the content. Loading twice is a no-op.
    fn load(&self) -> Result<()>;

    fn title(&self) -> String;

    /// Run `f` as one local transaction. Fails with `NotLoaded` before `load`.
    fn transact(&self, f: &mut dyn FnMut(&mut dyn ContentTxn) -> Result<()>) -> Result<()>;

    /// Root blocks with their subtrees.
    fn blocks(&self) -> Vec<BlockSnapshot>;

    /// Listen for committed local transactions.
    fn subscribe_local(&self, listener: Box<dyn Fn(&ContentChange) + Send + Sync>) -> Subscription;

    fn set_title(&self, title: &str) -> Result<()> {
        self.transact(&mut |txn| txn.set_title(title))
    }
}

/// Build the initial blocks of an empty document: a page holding a surface
/// and a note with one empty paragraph.
pub fn seed(txn: &mut dyn ContentTxn, title: &str) -> Result<()> {
    txn.set_title(title)?;
    let page = BlockSnapshot::new(FLAVOUR_PAGE)
        .with_prop(TITLE, title)
        .with_child(BlockSnapshot::new(FLAVOUR_SURFACE))
        .with_child(
            BlockSnapshot::new(FLAVOUR_NOTE).with_child(BlockSnapshot::new(FLAVOUR_PARAGRAPH)),
        );
    txn.insert_tree(None, &page)
}

/// Loro-backed document content.
pub struct LoroContent {
    id: DocId,
    doc: LoroDoc,
    page: LoroMap,
    blocks: LoroMovableList,
    loaded: AtomicBool,
    /// Snapshot applied on first load
    pending: Mutex<Option<Vec<u8>>>,
    txn_lock: Mutex<()>,
    local: Arc<EventBus<ContentChange>>,
}

impl LoroContent {
    /// Create empty, unloaded content.
    pub fn new(id: DocId) -> Self {
        let doc = LoroDoc::new();
        let page = doc.get_map(PAGE);
        let blocks = doc.get_movable_list(BLOCKS);
        Self {
            id,
            doc,
            page,
            blocks,
            loaded: AtomicBool::new(false),
            pending: Mutex::new(None),
            txn_lock: Mutex::new(()),
            local: Arc::new(EventBus::new()),
        }
    }

    /// Content that imports `bytes` when first loaded.
    pub fn from_snapshot(id: DocId, bytes: Vec<u8>) -> Self {
        let content = Self::new(id);
        *content.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes);
        content
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc.export(ExportMode::Snapshot).map_err(loro_err)
    }

    /// Apply updates from another replica. Not reported as a local change.
    pub fn import(&self, data: &[u8]) -> Result<()> {
        let _guard = self.txn_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.doc.import(data).map_err(loro_err)?;
        Ok(())
    }

    fn entries(&self) -> Vec<(String, BlockEntry)> {
        (0..self.blocks.len())
            .filter_map(|i| block_map(&self.blocks, i))
            .filter_map(|map| {
                let entry = BlockEntry::read(&map)?;
                Some((entry.id.clone(), entry))
            })
            .collect()
    }
}

struct BlockEntry {
    id: String,
    flavour: String,
    parent: Option<String>,
    props: RawFields,
}

impl BlockEntry {
    fn read(map: &LoroMap) -> Option<Self> {
        let Value::Object(mut fields) = loro_value_to_json(&map.get_deep_value()) else {
            return None;
        };
        let id = match fields.remove("id")? {
            Value::String(s) => s,
            _ => return None,
        };
        let flavour = match fields.remove("flavour") {
            Some(Value::String(s)) => s,
            _ => return None,
        };
        let parent = match fields.remove("parent") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let props = match fields.remove("props") {
            Some(Value::Object(props)) => props,
            _ => RawFields::new(),
        };
        Some(Self {
            id,
            flavour,
            parent,
            props,
        })
    }
}

fn block_map(blocks: &LoroMovableList, index: usize) -> Option<LoroMap> {
    match blocks.get(index)? {
        ValueOrContainer::Container(Container::Map(map)) => Some(map),
        _ => None,
    }
}

fn block_id_at(blocks: &LoroMovableList, index: usize) -> Option<String> {
    match block_map(blocks, index)?.get("id")? {
        ValueOrContainer::Value(LoroValue::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn build_tree(
    id: &str,
    entries: &HashMap<String, BlockEntry>,
    children: &HashMap<Option<String>, Vec<String>>,
) -> Option<BlockSnapshot> {
    let entry = entries.get(id)?;
    let kids = children
        .get(&Some(id.to_string()))
        .map(|ids| {
            ids.iter()
                .filter_map(|child| build_tree(child, entries, children))
                .collect()
        })
        .unwrap_or_default();
    Some(BlockSnapshot {
        id: entry.id.clone(),
        flavour: entry.flavour.clone(),
        props: entry.props.clone(),
        children: kids,
    })
}

impl DocContent for LoroContent {
    fn id(&self) -> &DocId {
        &self.id
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn load(&self) -> Result<()> {
        let _guard = self.txn_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_loaded() {
            return Ok(());
        }
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(bytes) = pending {
            self.doc.import(&bytes).map_err(loro_err)?;
            tracing::debug!(doc_id = %self.id, "Loaded {} bytes of content", bytes.len());
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn title(&self) -> String {
        match self.page.get(TITLE) {
            Some(ValueOrContainer::Value(LoroValue::String(s))) => s.to_string(),
            _ => String::new(),
        }
    }

    fn transact(&self, f: &mut dyn FnMut(&mut dyn ContentTxn) -> Result<()>) -> Result<()> {
        if !self.is_loaded() {
            return Err(ContentError::NotLoaded(self.id.clone()));
        }
        let result = {
            let _guard = self.txn_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut txn = LoroContentTxn { content: self };
            let result = f(&mut txn);
            self.doc.commit();
            result
        };
        self.local.emit(ContentChange {
            doc_id: self.id.clone(),
        });
        result
    }

    fn blocks(&self) -> Vec<BlockSnapshot> {
        let entries = self.entries();
        let mut children: HashMap<Option<String>, Vec<String>> = HashMap::new();
        for (id, entry) in &entries {
            children.entry(entry.parent.clone()).or_default().push(id.clone());
        }
        let roots = children.get(&None).cloned().unwrap_or_default();
        let entries: HashMap<String, BlockEntry> = entries.into_iter().collect();
        roots
            .iter()
            .filter_map(|id| build_tree(id, &entries, &children))
            .collect()
    }

    fn subscribe_local(&self, listener: Box<dyn Fn(&ContentChange) + Send + Sync>) -> Subscription {
        self.local.subscribe(move |change| listener(change))
    }
}

struct LoroContentTxn<'a> {
    content: &'a LoroContent,
}

impl LoroContentTxn<'_> {
    fn index_of(&self, block_id: &str) -> Option<usize> {
        let blocks = &self.content.blocks;
        (0..blocks.len()).find(|&i| block_id_at(blocks, i).as_deref() == Some(block_id))
    }

    fn push_block(&self, parent: Option<&str>, block: &BlockSnapshot) -> Result<()> {
        let blocks = &self.content.blocks;
        let map = blocks
            .insert_container(blocks.len(), LoroMap::new())
            .map_err(loro_err)?;
        map.insert("id", block.id.as_str()).map_err(loro_err)?;
        map.insert("flavour", block.flavour.as_str()).map_err(loro_err)?;
        if let Some(parent) = parent {
            map.insert("parent", parent).map_err(loro_err)?;
        }
        map.insert("props", Value::Object(block.props.clone()))
            .map_err(loro_err)?;
        for child in &block.children {
            self.push_block(Some(&block.id), child)?;
        }
        Ok(())
    }

    /// Merge `props` into the block at `index`; null values remove a key.
    fn merge_props(&self, index: usize, props: &[(&str, Value)]) -> Result<()> {
        let map = block_map(&self.content.blocks, index)
            .ok_or_else(|| ContentError::BlockNotFound(format!("#{index}")))?;
        let mut merged = BlockEntry::read(&map).map(|e| e.props).unwrap_or_default();
        for (key, value) in props {
            if value.is_null() {
                merged.remove(*key);
            } else {
                merged.insert(key.to_string(), value.clone());
            }
        }
        map.insert("props", Value::Object(merged)).map_err(loro_err)?;
        Ok(())
    }
}

impl ContentTxn for LoroContentTxn<'_> {
    fn set_title(&mut self, title: &str) -> Result<()> {
        self.content.page.insert(TITLE, title).map_err(loro_err)?;
        // Root page blocks mirror the title in their props
        let blocks = &self.content.blocks;
        for index in 0..blocks.len() {
            let is_page_root = block_map(blocks, index)
                .and_then(|m| BlockEntry::read(&m))
                .is_some_and(|e| e.flavour == FLAVOUR_PAGE && e.parent.is_none());
            if is_page_root {
                self.merge_props(index, &[(TITLE, Value::from(title))])?;
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let len = self.content.blocks.len();
        if len > 0 {
            self.content.blocks.delete(0, len).map_err(loro_err)?;
        }
        Ok(())
    }

    fn insert_tree(&mut self, parent: Option<&str>, block: &BlockSnapshot) -> Result<()> {
        if let Some(parent) = parent {
            if self.index_of(parent).is_none() {
                return Err(ContentError::BlockNotFound(parent.to_string()));
            }
        }
        self.push_block(parent, block)
    }

    fn update_props(&mut self, block_id: &str, props: &[(&str, Value)]) -> Result<()> {
        let index = self
            .index_of(block_id)
            .ok_or_else(|| ContentError::BlockNotFound(block_id.to_string()))?;
        self.merge_props(index, props)
    }

    fn remove_block(&mut self, block_id: &str) -> Result<()> {
        if self.index_of(block_id).is_none() {
            return Err(ContentError::BlockNotFound(block_id.to_string()));
        }
        // Parents precede children, so one forward pass collects the subtree
        let mut doomed: HashSet<String> = HashSet::from([block_id.to_string()]);
        let mut indexes = Vec::new();
        let blocks = &self.content.blocks;
        for index in 0..blocks.len() {
            let Some(entry) = block_map(blocks, index).and_then(|m| BlockEntry::read(&m)) else {
                continue;
            };
            let in_subtree = doomed.contains(&entry.id)
                || entry.parent.as_ref().is_some_and(|p| doomed.contains(p));
            if in_subtree {
                doomed.insert(entry.id);
                indexes.push(index);
            }
        }
        for index in indexes.into_iter().rev() {
            blocks.delete(index, 1).map_err(loro_err)?;
        }
        Ok(())
    }
}

/// Where content comes from.
pub trait ContentProvider: Send + Sync {
    fn get(&self, id: &DocId) -> Option<Arc<dyn DocContent>>;

    /// Create empty, loaded content for a new document.
    fn create(&self, id: &DocId) -> Result<Arc<dyn DocContent>>;

    /// Drop content created for a document whose metadata never landed.
    fn discard(&self, id: &DocId);
}

/// Provider keeping every document's content in memory.
#[derive(Default)]
pub struct MemoryContentProvider {
    docs: Mutex<HashMap<DocId, Arc<LoroContent>>>,
}

impl MemoryContentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register content created elsewhere, e.g. received from a peer.
    pub fn insert(&self, content: LoroContent) -> Arc<LoroContent> {
        let content = Arc::new(content);
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(content.id().clone(), Arc::clone(&content));
        content
    }

    pub fn remove(&self, id: &DocId) -> Option<Arc<LoroContent>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner()).remove(id)
    }

    pub fn loro(&self, id: &DocId) -> Option<Arc<LoroContent>> {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl ContentProvider for MemoryContentProvider {
    fn get(&self, id: &DocId) -> Option<Arc<dyn DocContent>> {
        self.loro(id).map(|c| c as Arc<dyn DocContent>)
    }

    fn create(&self, id: &DocId) -> Result<Arc<dyn DocContent>> {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        if docs.contains_key(id) {
            return Err(ContentError::AlreadyExists(id.clone()));
        }
        let content = Arc::new(LoroContent::new(id.clone()));
        content.load()?;
        docs.insert(id.clone(), Arc::clone(&content));
        Ok(content)
    }

    fn discard(&self, id: &DocId) {
        self.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn id(s: &str) -> DocId {
        s.parse().unwrap()
    }

    fn loaded(name: &str) -> LoroContent {
        let content = LoroContent::new(id(name));
        content.load().unwrap();
        content
    }

    #[test]
    fn test_transact_before_load_fails() {
        let content = LoroContent::new(id("a"));
        let err = content.set_title("Hello").unwrap_err();
        assert!(matches!(err, ContentError::NotLoaded(_)));
        assert_eq!(content.title(), "");
    }

    #[test]
    fn test_seed_builds_page_tree() {
        let content = loaded("a");
        content.transact(&mut |txn| seed(txn, "Notes")).unwrap();

        assert_eq!(content.title(), "Notes");
        let roots = content.blocks();
        assert_eq!(roots.len(), 1);
        let page = &roots[0];
        assert_eq!(page.flavour, FLAVOUR_PAGE);
        assert_eq!(page.count(), 4);
        let flavours: Vec<_> = page.children.iter().map(|c| c.flavour.as_str()).collect();
        assert_eq!(flavours, [FLAVOUR_SURFACE, FLAVOUR_NOTE]);
        assert!(page.find_flavour(FLAVOUR_PARAGRAPH).is_some());
    }

    #[test]
    fn test_set_title_updates_page_block() {
        let content = loaded("a");
        content.transact(&mut |txn| seed(txn, "Old")).unwrap();
        content.set_title("New").unwrap();

        assert_eq!(content.title(), "New");
        let page = &content.blocks()[0];
        assert_eq!(page.props.get(TITLE), Some(&Value::from("New")));
        let note = page.find_flavour(FLAVOUR_NOTE).unwrap();
        assert!(note.props.get(TITLE).is_none());
    }

    #[test]
    fn test_clear_and_reinsert() {
        let content = loaded("a");
        content.transact(&mut |txn| seed(txn, "Notes")).unwrap();
        let snapshot = content.blocks();

        content
            .transact(&mut |txn| {
                txn.clear()?;
                for block in &snapshot {
                    txn.insert_tree(None, block)?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(content.blocks(), snapshot);
    }

    #[test]
    fn test_update_props_and_remove_subtree() {
        let content = loaded("a");
        content.transact(&mut |txn| seed(txn, "Notes")).unwrap();
        let note_id = content.blocks()[0]
            .find_flavour(FLAVOUR_NOTE)
            .unwrap()
            .id
            .clone();

        content
            .transact(&mut |txn| txn.update_props(&note_id, &[("xywh", Value::from("[0,0,1,1]"))]))
            .unwrap();
        let note = content.blocks()[0].find_flavour(FLAVOUR_NOTE).cloned().unwrap();
        assert_eq!(note.props.get("xywh"), Some(&Value::from("[0,0,1,1]")));

        content.transact(&mut |txn| txn.remove_block(&note_id)).unwrap();
        let page = &content.blocks()[0];
        assert_eq!(page.count(), 2);
        assert!(page.find_flavour(FLAVOUR_PARAGRAPH).is_none());
    }

    #[test]
    fn test_missing_parent_is_error() {
        let content = loaded("a");
        let err = content
            .transact(&mut |txn| txn.insert_tree(Some("nope"), &BlockSnapshot::new(FLAVOUR_NOTE)))
            .unwrap_err();
        assert!(matches!(err, ContentError::BlockNotFound(b) if b == "nope"));
    }

    #[test]
    fn test_local_transactions_notify_subscribers() {
        let content = loaded("a");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = content.subscribe_local(Box::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        content.set_title("One").unwrap();
        content.set_title("Two").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let other = loaded("a");
        other.set_title("Remote").unwrap();
        content.import(&other.export_snapshot().unwrap()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_loads_lazily() {
        let source = loaded("a");
        source.transact(&mut |txn| seed(txn, "Notes")).unwrap();

        let copy = LoroContent::from_snapshot(id("a"), source.export_snapshot().unwrap());
        assert!(!copy.is_loaded());
        assert!(copy.blocks().is_empty());

        copy.load().unwrap();
        assert_eq!(copy.title(), "Notes");
        assert_eq!(copy.blocks(), source.blocks());
    }

    #[test]
    fn test_provider_create_twice_fails() {
        let provider = MemoryContentProvider::new();
        let doc = id("a");
        let content = provider.create(&doc).unwrap();
        assert!(content.is_loaded());
        assert!(provider.get(&doc).is_some());
        assert!(matches!(provider.create(&doc), Err(ContentError::AlreadyExists(_))));
    }
}
