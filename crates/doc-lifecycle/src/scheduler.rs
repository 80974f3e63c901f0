//! SyncScheduler: per-document sync phase, priority loading and bounded waits.
//!
//! Sits between handles and the `ReplicationTransport`. The transport owns the
//! sync state; the scheduler only reads it, collapses priority registrations
//! to one per document, and turns "wait until ready" into a call that always
//! returns.

use crate::config::LifecycleConfig;
use crate::transport::{self, DocSyncState, PriorityDisposer, ReplicationTransport};
use crate::DocId;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where a document is in its sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    /// Never connected and nothing loaded.
    Unregistered,
    /// Connected, waiting for the local copy.
    Loading,
    /// Renderable and editable.
    Ready,
    /// Fully reconciled with the remote.
    Synced,
    /// Exchanging updates again after a reconnect.
    Syncing,
}

impl SyncPhase {
    pub fn classify(registered: bool, state: &DocSyncState) -> Self {
        if state.synced && !state.syncing {
            SyncPhase::Synced
        } else if state.syncing && state.ready {
            SyncPhase::Syncing
        } else if state.ready {
            SyncPhase::Ready
        } else if registered || state.loaded {
            SyncPhase::Loading
        } else {
            SyncPhase::Unregistered
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, SyncPhase::Ready | SyncPhase::Synced | SyncPhase::Syncing)
    }
}

impl From<DocSyncState> for SyncPhase {
    fn from(state: DocSyncState) -> Self {
        SyncPhase::classify(false, &state)
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Unregistered => "unregistered",
            SyncPhase::Loading => "loading",
            SyncPhase::Ready => "ready",
            SyncPhase::Synced => "synced",
            SyncPhase::Syncing => "syncing",
        };
        f.write_str(name)
    }
}

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    TimedOut,
    Aborted,
}

impl WaitOutcome {
    pub fn is_reached(self) -> bool {
        self == WaitOutcome::Reached
    }
}

#[derive(Default)]
struct PriorityBucket {
    weights: HashMap<u64, i32>,
    /// Weight currently registered with the transport.
    active: Option<(i32, PriorityDisposer)>,
}

impl PriorityBucket {
    fn max_weight(&self) -> Option<i32> {
        self.weights.values().copied().max()
    }
}

struct SchedulerInner {
    transport: Arc<dyn ReplicationTransport>,
    running: AtomicBool,
    registered: Mutex<HashSet<DocId>>,
    priorities: Mutex<HashMap<DocId, PriorityBucket>>,
    next_token: AtomicU64,
    ready_timeout: Duration,
    sync_timeout: Option<Duration>,
}

impl SchedulerInner {
    fn priorities(&self) -> MutexGuard<'_, HashMap<DocId, PriorityBucket>> {
        self.priorities.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring the transport registration in line with the bucket's max weight.
    /// Returns the disposer being replaced, to be run after unlocking.
    fn reconcile(
        &self,
        doc_id: &DocId,
        priorities: &mut HashMap<DocId, PriorityBucket>,
    ) -> Option<PriorityDisposer> {
        let bucket = priorities.get_mut(doc_id)?;
        let wanted = bucket.max_weight();
        let current = bucket.active.as_ref().map(|(w, _)| *w);
        if wanted == current {
            return None;
        }

        let replaced = bucket.active.take().map(|(_, dispose)| dispose);
        match wanted {
            Some(weight) => {
                debug!(doc_id = %doc_id, weight, "Registering priority");
                let dispose = self.transport.add_priority(doc_id, weight);
                bucket.active = Some((weight, dispose));
            }
            None => {
                debug!(doc_id = %doc_id, "Dropping priority");
                priorities.remove(doc_id);
            }
        }
        replaced
    }

    fn remove_priority(&self, doc_id: &DocId, token: u64) {
        let replaced = {
            let mut priorities = self.priorities();
            let removed = priorities
                .get_mut(doc_id)
                .is_some_and(|bucket| bucket.weights.remove(&token).is_some());
            if removed {
                self.reconcile(doc_id, &mut priorities)
            } else {
                None
            }
        };
        if let Some(dispose) = replaced {
            dispose();
        }
    }
}

/// Coordinates sync for every open document.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    pub fn new(transport: Arc<dyn ReplicationTransport>, config: &LifecycleConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                transport,
                running: AtomicBool::new(false),
                registered: Mutex::new(HashSet::new()),
                priorities: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                ready_timeout: config.ready_timeout(),
                sync_timeout: config.sync_timeout(),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn ReplicationTransport> {
        &self.inner.transport
    }

    pub fn start(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Starting sync scheduler");
            self.inner.transport.start();
        }
    }

    /// Stop replicating. Loaded content and sync state are left as they are.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            debug!("Stopping sync scheduler");
            self.inner.transport.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register `doc_id` with the transport. Connecting twice is a no-op.
    pub fn connect(&self, doc_id: &DocId) {
        let inserted = self
            .inner
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id.clone());
        if inserted {
            debug!(doc_id = %doc_id, "Connecting document");
            self.inner.transport.connect(doc_id);
        }
    }

    pub fn is_connected(&self, doc_id: &DocId) -> bool {
        self.inner
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(doc_id)
    }

    pub fn state(&self, doc_id: &DocId) -> DocSyncState {
        *self.inner.transport.doc_state(doc_id).borrow()
    }

    pub fn phase(&self, doc_id: &DocId) -> SyncPhase {
        SyncPhase::classify(self.is_connected(doc_id), &self.state(doc_id))
    }

    pub fn watch_state(&self, doc_id: &DocId) -> watch::Receiver<DocSyncState> {
        self.inner.transport.doc_state(doc_id)
    }

    /// Raise the load priority of `doc_id` while the guard lives.
    ///
    /// Guards for the same document share one transport registration
    /// carrying the highest live weight.
    pub fn add_priority(&self, doc_id: &DocId, weight: i32) -> PriorityGuard {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let replaced = {
            let mut priorities = self.inner.priorities();
            priorities
                .entry(doc_id.clone())
                .or_default()
                .weights
                .insert(token, weight);
            self.inner.reconcile(doc_id, &mut priorities)
        };
        if let Some(dispose) = replaced {
            dispose();
        }

        PriorityGuard {
            scheduler: Arc::downgrade(&self.inner),
            doc_id: doc_id.clone(),
            token,
            disposed: false,
        }
    }

    /// Highest live weight for `doc_id`.
    pub fn priority(&self, doc_id: &DocId) -> Option<i32> {
        self.inner
            .priorities()
            .get(doc_id)
            .and_then(PriorityBucket::max_weight)
    }

    /// Wait until `doc_id` is ready, bounded by `timeout` or the configured
    /// default. Never fails: a slow document resolves `TimedOut`.
    pub async fn wait_for_ready(
        &self,
        doc_id: &DocId,
        timeout: Option<Duration>,
        abort: Option<&CancellationToken>,
    ) -> WaitOutcome {
        let timeout = timeout.unwrap_or(self.inner.ready_timeout);
        self.wait_for(doc_id, |s| s.ready || s.synced, Some(timeout), abort, "ready")
            .await
    }

    /// Wait until `doc_id` is synced. Unbounded unless `timeout` or the
    /// configured sync timeout is set.
    pub async fn wait_for_synced(
        &self,
        doc_id: &DocId,
        timeout: Option<Duration>,
        abort: Option<&CancellationToken>,
    ) -> WaitOutcome {
        let timeout = timeout.or(self.inner.sync_timeout);
        self.wait_for(doc_id, |s| s.synced && !s.syncing, timeout, abort, "synced")
            .await
    }

    async fn wait_for(
        &self,
        doc_id: &DocId,
        pred: fn(&DocSyncState) -> bool,
        timeout: Option<Duration>,
        abort: Option<&CancellationToken>,
        goal: &'static str,
    ) -> WaitOutcome {
        let mut rx = self.inner.transport.doc_state(doc_id);
        let reached = transport::wait_until(&mut rx, pred);
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let aborted = async {
            match abort {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = aborted => WaitOutcome::Aborted,
            ok = reached => {
                if ok {
                    WaitOutcome::Reached
                } else {
                    warn!(doc_id = %doc_id, goal, "Sync state stream closed while waiting");
                    WaitOutcome::TimedOut
                }
            }
            _ = deadline => {
                warn!(doc_id = %doc_id, goal, ?timeout, "Timed out waiting for document");
                WaitOutcome::TimedOut
            }
        };
        debug!(doc_id = %doc_id, goal, ?outcome, "Wait finished");
        outcome
    }
}

/// Keeps a priority registration alive. Dropping it removes the weight.
pub struct PriorityGuard {
    scheduler: Weak<SchedulerInner>,
    doc_id: DocId,
    token: u64,
    disposed: bool,
}

impl PriorityGuard {
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// Remove the weight now. Calling it again does nothing.
    pub fn dispose(&mut self) {
        if std::mem::replace(&mut self.disposed, true) {
            return;
        }
        if let Some(inner) = self.scheduler.upgrade() {
            inner.remove_priority(&self.doc_id, self.token);
        }
    }
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for PriorityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityGuard")
            .field("doc_id", &self.doc_id)
            .field("disposed", &self.disposed)
            .finish()
    }
}
