//! ReplicationTransport trait for the network/persistence layer under sync.
//!
//! The transport owns per-document sync state and writes it; this crate only
//! reads it and hints priorities.
//!
//! Implementations:
//! - `MemoryTransport` - For testing and offline use, state driven by hand

use crate::DocId;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Sync state of one document as reported by the transport.
///
/// Within one connection epoch it improves monotonically
/// loaded → ready → synced; a reconnect sets `syncing` and clears `synced`
/// while keeping `loaded`/`ready`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DocSyncState {
    /// Local copy loaded from persistence.
    pub loaded: bool,
    /// Enough state to render and edit.
    pub ready: bool,
    /// Fully reconciled with the remote.
    pub synced: bool,
    /// Currently exchanging updates.
    pub syncing: bool,
}

/// Undoes one `add_priority` registration.
pub type PriorityDisposer = Box<dyn FnOnce() + Send + Sync>;

/// Wait until `pred` holds for the channel's value.
///
/// Returns `false` if the sender went away first.
pub async fn wait_until(
    rx: &mut watch::Receiver<DocSyncState>,
    pred: impl Fn(&DocSyncState) -> bool + Send,
) -> bool {
    loop {
        let reached = pred(&rx.borrow_and_update());
        if reached {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Network/persistence layer replicating individual documents.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    fn start(&self);

    fn stop(&self);

    /// Begin replicating `doc_id`.
    fn connect(&self, doc_id: &DocId);

    /// Live sync state for `doc_id`.
    fn doc_state(&self, doc_id: &DocId) -> watch::Receiver<DocSyncState>;

    /// Ask the transport to fetch/reconcile `doc_id` ahead of others.
    fn add_priority(&self, doc_id: &DocId, weight: i32) -> PriorityDisposer;

    async fn wait_for_doc_loaded(&self, doc_id: &DocId) -> bool {
        let mut rx = self.doc_state(doc_id);
        wait_until(&mut rx, |s| s.loaded).await
    }

    async fn wait_for_synced(&self, doc_id: &DocId) -> bool {
        let mut rx = self.doc_state(doc_id);
        wait_until(&mut rx, |s| s.synced).await
    }
}

/// In-memory transport for testing
#[derive(Default)]
pub struct MemoryTransport {
    started: AtomicBool,
    states: Mutex<HashMap<DocId, watch::Sender<DocSyncState>>>,
    connected: Mutex<HashSet<DocId>>,
    priorities: Arc<Mutex<HashMap<DocId, Vec<(u64, i32)>>>>,
    next_registration: AtomicU64,
    /// Total `add_priority` calls, for asserting deduplication
    registrations: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, doc_id: &DocId) -> watch::Sender<DocSyncState> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .entry(doc_id.clone())
            .or_insert_with(|| watch::channel(DocSyncState::default()).0)
            .clone()
    }

    pub fn set_state(&self, doc_id: &DocId, state: DocSyncState) {
        self.sender(doc_id).send_replace(state);
    }

    pub fn state(&self, doc_id: &DocId) -> DocSyncState {
        *self.sender(doc_id).borrow()
    }

    pub fn mark_loaded(&self, doc_id: &DocId) {
        self.sender(doc_id).send_modify(|s| s.loaded = true);
    }

    pub fn mark_ready(&self, doc_id: &DocId) {
        self.sender(doc_id).send_modify(|s| {
            s.loaded = true;
            s.ready = true;
        });
    }

    pub fn mark_synced(&self, doc_id: &DocId) {
        self.sender(doc_id).send_modify(|s| {
            s.loaded = true;
            s.ready = true;
            s.synced = true;
            s.syncing = false;
        });
    }

    /// Simulate a reconnect: every document goes back to syncing without
    /// losing what it already loaded.
    pub fn reconnect(&self) {
        let senders: Vec<_> = self
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for tx in senders {
            tx.send_modify(|s| {
                s.synced = false;
                s.syncing = true;
            });
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self, doc_id: &DocId) -> bool {
        self.connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(doc_id)
    }

    /// Highest registered weight for `doc_id`.
    pub fn priority(&self, doc_id: &DocId) -> Option<i32> {
        self.priorities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(doc_id)
            .and_then(|regs| regs.iter().map(|(_, w)| *w).max())
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationTransport for MemoryTransport {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn connect(&self, doc_id: &DocId) {
        self.connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id.clone());
    }

    fn doc_state(&self, doc_id: &DocId) -> watch::Receiver<DocSyncState> {
        self.sender(doc_id).subscribe()
    }

    fn add_priority(&self, doc_id: &DocId, weight: i32) -> PriorityDisposer {
        let token = self.next_registration.fetch_add(1, Ordering::SeqCst);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.priorities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(doc_id.clone())
            .or_default()
            .push((token, weight));

        let priorities = Arc::clone(&self.priorities);
        let doc_id = doc_id.clone();
        Box::new(move || {
            let mut priorities = priorities.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(regs) = priorities.get_mut(&doc_id) {
                regs.retain(|(t, _)| *t != token);
                if regs.is_empty() {
                    priorities.remove(&doc_id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DocId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_wait_for_doc_loaded_resolves_on_update() {
        let transport = Arc::new(MemoryTransport::new());
        let doc = id("a");

        let waiter = {
            let transport = Arc::clone(&transport);
            let doc = doc.clone();
            tokio::spawn(async move { transport.wait_for_doc_loaded(&doc).await })
        };
        tokio::task::yield_now().await;
        transport.mark_loaded(&doc);

        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_reconnect_keeps_loaded_state() {
        let transport = MemoryTransport::new();
        let doc = id("a");
        transport.mark_synced(&doc);
        transport.reconnect();

        let state = transport.state(&doc);
        assert!(state.loaded && state.ready);
        assert!(state.syncing);
        assert!(!state.synced);
    }

    #[test]
    fn test_priority_disposer_removes_registration() {
        let transport = MemoryTransport::new();
        let doc = id("a");
        let low = transport.add_priority(&doc, 1);
        let high = transport.add_priority(&doc, 5);
        assert_eq!(transport.priority(&doc), Some(5));

        high();
        assert_eq!(transport.priority(&doc), Some(1));
        low();
        assert_eq!(transport.priority(&doc), None);
    }
}
