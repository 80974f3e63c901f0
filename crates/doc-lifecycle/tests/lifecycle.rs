//! End-to-end tests for doc-lifecycle.
//!
//! Drives the full service: metadata store, content provider, transport,
//! pooled handles, duplication and templating.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use doc_lifecycle::content::{FLAVOUR_NOTE, FLAVOUR_PAGE};
use doc_lifecycle::{
    next_duplicate_title, ContentProvider, CreateDocOptions, CreateHook, DocContent, DocEvent,
    DocId, DocumentLifecycleService, DocumentMetadataRecord, LifecycleConfig, LifecycleError,
    LoroContent, LoroMetaStore, MemoryContentProvider, MemoryTransport, MetaStore, PrimaryMode, Subscription,
};
use serde_json::Value;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Service wired to in-memory collaborators, recording every event.
struct Harness {
    service: DocumentLifecycleService,
    store: Arc<LoroMetaStore>,
    contents: Arc<MemoryContentProvider>,
    transport: Arc<MemoryTransport>,
    events: Arc<Mutex<Vec<DocEvent>>>,
    _events_sub: Subscription,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    fn with_config(config: LifecycleConfig) -> Self {
        init_tracing();
        let store = Arc::new(LoroMetaStore::new());
        let contents = Arc::new(MemoryContentProvider::new());
        let transport = Arc::new(MemoryTransport::new());
        let service = DocumentLifecycleService::new(
            store.clone(),
            contents.clone(),
            transport.clone(),
            config,
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = service.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        service.start();

        Self {
            service,
            store,
            contents,
            transport,
            events,
            _events_sub: sub,
        }
    }

    fn create(&self, title: &str) -> DocumentMetadataRecord {
        self.service
            .create_doc(CreateDocOptions::titled(title))
            .expect("Failed to create document")
    }

    fn count_events(&self, pred: impl Fn(&DocEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn block_ids(&self, id: &DocId) -> Vec<String> {
        let mut ids = Vec::new();
        for root in self.contents.get(id).unwrap().blocks() {
            root.walk(&mut |b| ids.push(b.id.clone()));
        }
        ids
    }
}

#[test]
fn test_open_twice_release_twice_evicts_once() {
    let h = Harness::new();
    let meta = h.create("Shared");

    let first = h.service.open(&meta.id).unwrap();
    let second = h.service.open(&meta.id).unwrap();
    assert!(Arc::ptr_eq(first.handle(), second.handle()));

    drop(first);
    assert_eq!(h.count_events(|e| matches!(e, DocEvent::Evicted { .. })), 0);
    second.release();
    assert_eq!(h.count_events(|e| matches!(e, DocEvent::Evicted { .. })), 1);

    // A fresh open builds a new handle
    let third = h.service.open(&meta.id).unwrap();
    assert_eq!(third.meta().unwrap().title, "Shared");
    drop(third);
    assert_eq!(h.count_events(|e| matches!(e, DocEvent::Evicted { .. })), 2);
}

#[test]
fn test_lookups_hit_position_cache_after_first_resolution() {
    let h = Harness::new();
    let docs: Vec<_> = (0..20).map(|i| h.create(&format!("Doc {i}"))).collect();
    let target = &docs[15].id;

    let projector = h.service.projector();
    assert!(projector.exists(target));
    let before = projector.stats();
    for _ in 0..10 {
        assert!(projector.meta(target).is_some());
    }
    let after = projector.stats();
    assert_eq!(after.full_scans, before.full_scans);
    assert!(after.cache_hits >= before.cache_hits + 10);
}

#[test]
fn test_trash_partition_tracks_writes() {
    let h = Harness::new();
    let a = h.create("A");
    let b = h.create("B");
    let trash = h.service.projector().watch_trash_ids();
    let live = h.service.projector().watch_non_trash_ids();

    h.service.move_to_trash(&a.id).unwrap();
    assert_eq!(*trash.borrow(), vec![a.id.clone()]);
    assert_eq!(*live.borrow(), vec![b.id.clone()]);

    h.service.restore_from_trash(&a.id).unwrap();
    assert!(trash.borrow().is_empty());
    assert_eq!(live.borrow().len(), 2);
}

#[test]
fn test_failed_content_creation_leaves_no_record() {
    let h = Harness::new();
    let id: DocId = "x".parse().unwrap();
    h.contents.insert(LoroContent::new(id.clone()));

    let options = CreateDocOptions {
        id: Some(id.clone()),
        ..CreateDocOptions::titled("X")
    };
    let err = h.service.create_doc(options.clone()).unwrap_err();
    assert!(matches!(err, LifecycleError::Content(_)));
    assert!(!h.service.projector().exists(&id));
    assert_eq!(h.count_events(|e| matches!(e, DocEvent::Created { .. })), 0);

    // Once the stale content is gone the same id can be created
    h.contents.remove(&id);
    let created = h.service.create_doc(options).unwrap();
    assert_eq!(created.id, id);
    assert_eq!(h.contents.get(&id).unwrap().title(), "X");
}

#[test]
fn test_lease_released_when_use_panics() {
    let h = Harness::new();
    let meta = h.create("Fragile");

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let lease = h.service.open(&meta.id).unwrap();
        assert_eq!(h.service.lease_count(&meta.id), 1);
        lease.rename("Halfway").unwrap();
        panic!("editor crashed");
    }));

    assert!(result.is_err());
    assert_eq!(h.service.lease_count(&meta.id), 0);
    assert!(!h.service.is_open(&meta.id));
    assert_eq!(h.count_events(|e| matches!(e, DocEvent::Evicted { .. })), 1);
    assert_eq!(h.service.projector().meta(&meta.id).unwrap().title, "Halfway");
}

#[test]
fn test_lease_released_when_use_fails() {
    let h = Harness::new();
    let meta = h.create("Strict");

    let edit = |id: &DocId| -> Result<(), LifecycleError> {
        let lease = h.service.open(id)?;
        lease.set_property("id", Value::from("other"))?;
        Ok(())
    };

    assert!(matches!(edit(&meta.id), Err(LifecycleError::Handle(_))));
    assert_eq!(h.service.lease_count(&meta.id), 0);
    assert!(!h.service.is_open(&meta.id));
}

#[tokio::test]
async fn test_rename_keeps_page_block_title_in_step() {
    let h = Harness::new();
    let meta = h.create("Old");
    h.service.change_doc_title(&meta.id, "New").unwrap();

    let page_title = |id: &DocId| {
        h.contents.get(id).unwrap().blocks()[0]
            .props
            .get("title")
            .cloned()
    };
    assert_eq!(h.contents.get(&meta.id).unwrap().title(), "New");
    assert_eq!(page_title(&meta.id), Some(Value::from("New")));

    h.transport.mark_synced(&meta.id);
    let copy = h.service.duplicate(&meta.id, None).await.unwrap().unwrap();
    assert_eq!(page_title(&copy), Some(Value::from("New(1)")));
}

#[tokio::test]
async fn test_duplicate_copies_without_aliasing_ids() {
    let h = Harness::new();
    let mut options = CreateDocOptions::titled("Notes");
    options.tags.insert("work".into());
    options.primary_mode = Some(PrimaryMode::Edgeless);
    options.properties.insert("color".into(), Value::from("green"));
    options.properties.insert("isTemplate".into(), Value::Bool(true));
    let source = h.service.create_doc(options).unwrap();
    h.service.add_linked_doc(&source.id, &h.create("Other").id).unwrap();
    h.transport.mark_synced(&source.id);

    let copy_id = h.service.duplicate(&source.id, None).await.unwrap().unwrap();
    assert_ne!(copy_id, source.id);

    let copy = h.service.projector().meta(&copy_id).unwrap();
    assert_eq!(copy.title, "Notes(1)");
    assert_eq!(copy.tags, source.tags);
    assert_eq!(copy.primary_mode, PrimaryMode::Edgeless);
    assert_eq!(copy.custom_properties.get("color"), Some(&Value::from("green")));
    assert!(!copy.is_template());

    let source_blocks = h.block_ids(&source.id);
    let copy_blocks = h.block_ids(&copy_id);
    assert_eq!(source_blocks.len(), copy_blocks.len());
    assert!(copy_blocks.iter().all(|id| !source_blocks.contains(id)));
    assert_eq!(
        h.service.linked_docs(&copy_id).unwrap(),
        h.service.linked_docs(&source.id).unwrap()
    );
    assert_eq!(h.contents.get(&copy_id).unwrap().title(), "Notes(1)");

    // Every lease taken during the copy was given back
    assert!(!h.service.is_open(&source.id));
    assert!(!h.service.is_open(&copy_id));
    assert_eq!(
        h.count_events(|e| matches!(e, DocEvent::Duplicated { complete: true, .. })),
        1
    );

    h.transport.mark_synced(&copy_id);
    let second = h.service.duplicate(&copy_id, None).await.unwrap().unwrap();
    assert_eq!(h.service.projector().meta(&second).unwrap().title, "Notes(2)");
}

#[tokio::test]
async fn test_duplicate_into_existing_target() {
    let h = Harness::new();
    let source = h.create("Plan(3)");
    let target = h.create("Scratch");
    h.transport.mark_synced(&source.id);
    let before = h.block_ids(&target.id);

    let written = h
        .service
        .duplicate(&source.id, Some(&target.id))
        .await
        .unwrap();
    assert_eq!(written, Some(target.id.clone()));
    assert_eq!(h.service.projector().meta(&target.id).unwrap().title, "Plan(4)");

    let after = h.block_ids(&target.id);
    assert_eq!(after.len(), h.block_ids(&source.id).len());
    assert!(after.iter().all(|id| !before.contains(id)));
}

#[tokio::test]
async fn test_duplicate_of_trashed_source_is_noop() {
    let h = Harness::new();
    let source = h.create("Gone");
    h.service.move_to_trash(&source.id).unwrap();
    let docs_before = h.service.projector().ids().len();

    assert_eq!(h.service.duplicate(&source.id, None).await.unwrap(), None);
    assert_eq!(h.service.projector().ids().len(), docs_before);
    assert_eq!(h.count_events(|e| matches!(e, DocEvent::Duplicated { .. })), 0);
}

#[tokio::test]
async fn test_duplicate_content_failure_is_swallowed() {
    let h = Harness::new();
    let source = h.create("Source");
    let target = h.create("Target");
    h.transport.mark_synced(&source.id);
    h.contents.remove(&target.id);

    let written = h
        .service
        .duplicate(&source.id, Some(&target.id))
        .await
        .unwrap();
    assert_eq!(written, Some(target.id.clone()));
    assert_eq!(
        h.service.projector().meta(&target.id).unwrap().title,
        next_duplicate_title("Source")
    );
    assert_eq!(
        h.count_events(|e| matches!(e, DocEvent::Duplicated { complete: false, .. })),
        1
    );
    assert!(!h.service.is_open(&source.id));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_wait_is_bounded() {
    let h = Harness::new();
    let source = h.create("Never synced");
    let start = tokio::time::Instant::now();

    let copy = h.service.duplicate(&source.id, None).await.unwrap();
    assert!(copy.is_some());
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.transport.priority(&source.id), None);
}

#[test]
fn test_create_from_template_keeps_title() {
    let h = Harness::new();
    let mut options = CreateDocOptions::titled("Weekly review");
    options.properties.insert("isTemplate".into(), Value::Bool(true));
    options.properties.insert("icon".into(), Value::from("calendar"));
    let template = h.service.create_doc(options).unwrap();

    let doc = h
        .service
        .create_from_template(&template.id, CreateDocOptions::default())
        .unwrap();
    assert_eq!(doc.title, "Weekly review");
    assert!(!doc.is_template());
    assert_eq!(doc.custom_properties.get("icon"), Some(&Value::from("calendar")));

    let named = h
        .service
        .create_from_template(&template.id, CreateDocOptions::titled("Week 12"))
        .unwrap();
    assert_eq!(named.title, "Week 12");
    let content = h.contents.get(&named.id).unwrap();
    assert_eq!(content.title(), "Week 12");
    let roots = content.blocks();
    assert_eq!(roots[0].flavour, FLAVOUR_PAGE);
    assert!(roots[0].find_flavour(FLAVOUR_NOTE).is_some());
}

struct Prefixer {
    seen: Mutex<Vec<(String, usize)>>,
}

impl CreateHook for Prefixer {
    fn before_create(&self, options: &mut CreateDocOptions) {
        let title = options.title.take().unwrap_or_default();
        options.title = Some(format!("Inbox: {title}"));
    }

    fn after_create(&self, record: &DocumentMetadataRecord, content: &dyn DocContent) {
        self.seen
            .lock()
            .unwrap()
            .push((record.title.clone(), content.blocks().len()));
    }
}

#[test]
fn test_hooks_shape_created_documents() {
    let h = Harness::new();
    let hook = Arc::new(Prefixer {
        seen: Mutex::new(Vec::new()),
    });
    h.service.register_hook(hook.clone());

    let meta = h.create("Idea");
    assert_eq!(meta.title, "Inbox: Idea");
    assert_eq!(h.contents.get(&meta.id).unwrap().title(), "Inbox: Idea");
    assert_eq!(
        *hook.seen.lock().unwrap(),
        vec![("Inbox: Idea".to_string(), 1)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_when_ready_times_out_with_phase() {
    let config = LifecycleConfig::from_yaml_str("readyTimeoutMs: 200\n").unwrap();
    let h = Harness::with_config(config);
    let meta = h.create("Remote");
    h.contents.remove(&meta.id);
    h.contents.insert(doc_lifecycle::LoroContent::new(meta.id.clone()));

    let start = tokio::time::Instant::now();
    match h.service.open_when_ready(&meta.id, None).await {
        Err(LifecycleError::NotReady { id, .. }) => assert_eq!(id, meta.id),
        other => panic!("expected NotReady, got {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_remote_metadata_flows_into_views() {
    let h = Harness::new();
    let local = h.create("Local");
    let ids = h.service.projector().watch_ids();

    let remote_store = Arc::new(LoroMetaStore::with_peer_id(7).unwrap());
    let remote = DocumentLifecycleService::new(
        remote_store.clone(),
        Arc::new(MemoryContentProvider::new()),
        Arc::new(MemoryTransport::new()),
        LifecycleConfig::default(),
    );
    let remote_doc = remote
        .create_doc(CreateDocOptions::titled("From peer"))
        .unwrap();
    assert_eq!(remote_store.len(), 1);

    h.store.import(&remote_store.export_snapshot().unwrap()).unwrap();

    let seen = ids.borrow().clone();
    assert!(seen.contains(&local.id));
    assert!(seen.contains(&remote_doc.id));
    assert_eq!(
        h.service.projector().meta(&remote_doc.id).unwrap().title,
        "From peer"
    );
}
