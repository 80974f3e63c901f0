//! doc-lifecycle: document lifecycle and sync core for a collaborative,
//! offline-capable workspace.
//!
//! This crate provides:
//! - A reference-counted pool sharing one handle per open document
//! - Live, incrementally updated metadata views over a replicated Loro structure
//! - Sync scheduling with priority loading and bounded waits
//! - Document handles, creation, duplication and templating
//! - MetaStore, DocContent and ReplicationTransport trait abstractions

pub mod config;
pub mod content;
pub mod doc_id;
pub mod duplicate;
pub mod events;
pub mod handle;
pub mod hooks;
pub mod pool;
pub mod projector;
pub mod record;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod throttle;
pub mod transport;

pub use config::{ConfigError, LifecycleConfig};
pub use content::{
    BlockSnapshot, ContentError, ContentProvider, DocContent, LoroContent, MemoryContentProvider,
};
pub use doc_id::{DocId, DocIdError};
pub use duplicate::next_duplicate_title;
pub use events::{DocEvent, EventBus, Subscription};
pub use handle::{DocumentHandle, HandleError};
pub use hooks::{CreateHook, HookRegistry};
pub use pool::{ObjectPool, PoolError, PoolOptions, PoolRef};
pub use projector::{DocRecord, LookupStats, MetadataProjector, RecordError};
pub use record::{DocumentMetadataRecord, PrimaryMode, TagId};
pub use scheduler::{PriorityGuard, SyncPhase, SyncScheduler, WaitOutcome};
pub use service::{CreateDocOptions, DocLease, DocumentLifecycleService, LifecycleError, Missing};
pub use store::{LoroMetaStore, MetaStore, StoreError};
pub use transport::{DocSyncState, MemoryTransport, ReplicationTransport};
