//! ObjectPool: keyed cache of live objects with reference counting.
//!
//! Every `put`/`get` hands out a `PoolRef` that holds one reference. When the
//! last reference is released the pool asks its dangling policy whether to
//! keep the object around; if not, the entry is evicted and `on_delete` runs.
//!
//! Callbacks always run with the pool unlocked, so they may call back into
//! the pool (e.g. an `on_delete` that opens another entry).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool already holds an entry for key {0}")]
    Occupied(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

type DeleteFn<K, T> = Box<dyn Fn(&K, T) + Send + Sync>;
type DanglingFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Per-pool eviction policy.
pub struct PoolOptions<K, T> {
    on_delete: Option<DeleteFn<K, T>>,
    on_dangling: Option<DanglingFn<T>>,
}

impl<K, T> Default for PoolOptions<K, T> {
    fn default() -> Self {
        Self {
            on_delete: None,
            on_dangling: None,
        }
    }
}

impl<K, T> PoolOptions<K, T> {
    /// Called once with the evicted object.
    pub fn on_delete(mut self, f: impl Fn(&K, T) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    /// Called when the reference count reaches zero. Returning `true` keeps
    /// the object pooled (a later `get` revives it); `false` evicts it.
    pub fn on_dangling(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.on_dangling = Some(Box::new(f));
        self
    }
}

struct Entry<T> {
    object: T,
    ref_count: usize,
    /// Distinguishes re-inserted keys so stale refs cannot release a newer entry.
    generation: u64,
}

struct PoolInner<K, T> {
    entries: Mutex<HashMap<K, Entry<T>>>,
    next_generation: Mutex<u64>,
    options: PoolOptions<K, T>,
}

impl<K, T> PoolInner<K, T> {
    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reference-counted pool of objects keyed by `K`.
///
/// `T` is typically an `Arc<_>` so that every reference observes the same
/// object identity.
pub struct ObjectPool<K, T> {
    inner: Arc<PoolInner<K, T>>,
}

impl<K, T> Clone for ObjectPool<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> Default for ObjectPool<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl<K, T> ObjectPool<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    pub fn new(options: PoolOptions<K, T>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                options,
            }),
        }
    }

    /// Acquire another reference to a pooled object.
    ///
    /// Returns `None` if the key was never put or has been evicted.
    pub fn get(&self, key: &K) -> Option<PoolRef<K, T>> {
        let mut entries = self.inner.entries();
        let entry = entries.get_mut(key)?;
        entry.ref_count += 1;
        debug!("Pool hit for {} (refs: {})", key, entry.ref_count);
        Some(PoolRef {
            pool: Arc::clone(&self.inner),
            key: key.clone(),
            object: entry.object.clone(),
            generation: entry.generation,
            released: false,
        })
    }

    /// Insert a new object with a reference count of one.
    pub fn put(&self, key: K, object: T) -> Result<PoolRef<K, T>> {
        let generation = {
            let mut next = self
                .inner
                .next_generation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };

        let mut entries = self.inner.entries();
        if entries.contains_key(&key) {
            return Err(PoolError::Occupied(key.to_string()));
        }
        entries.insert(
            key.clone(),
            Entry {
                object: object.clone(),
                ref_count: 1,
                generation,
            },
        );
        debug!("Pool insert for {}", key);

        Ok(PoolRef {
            pool: Arc::clone(&self.inner),
            key,
            object,
            generation,
            released: false,
        })
    }

    /// Drop one reference for `key` without a `PoolRef`.
    ///
    /// Releasing a key that has no outstanding references is a no-op that
    /// returns `false`.
    pub fn release_key(&self, key: &K) -> bool {
        let generation = match self.inner.entries().get(key) {
            Some(entry) => entry.generation,
            None => {
                warn!("Release of unknown pool key {}", key);
                return false;
            }
        };
        release(&self.inner, key, generation)
    }

    /// Current reference count, or `None` if the key is not pooled.
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.inner.entries().get(key).map(|e| e.ref_count)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every entry regardless of outstanding references.
    ///
    /// Refs still held afterwards release as no-ops.
    pub fn clear(&self) {
        let drained: Vec<(K, Entry<T>)> = self.inner.entries().drain().collect();
        for (key, entry) in drained {
            debug!("Pool clear evicting {}", key);
            if let Some(on_delete) = &self.inner.options.on_delete {
                on_delete(&key, entry.object);
            }
        }
    }
}

fn release<K, T>(inner: &PoolInner<K, T>, key: &K, generation: u64) -> bool
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    let dangling = {
        let mut entries = inner.entries();
        let Some(entry) = entries.get_mut(key) else {
            debug!("Release after eviction of {}", key);
            return false;
        };
        if entry.generation != generation {
            debug!("Stale release for {} ignored", key);
            return false;
        }
        if entry.ref_count == 0 {
            warn!("Over-release of pool key {}", key);
            return false;
        }
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return true;
        }
        entry.object.clone()
    };

    let keep = inner
        .options
        .on_dangling
        .as_ref()
        .map(|f| f(&dangling))
        .unwrap_or(false);
    drop(dangling);
    if keep {
        debug!("Pool retaining dangling {}", key);
        return true;
    }

    let evicted = {
        let mut entries = inner.entries();
        // Re-check: the dangling policy ran unlocked and may have re-acquired
        match entries.get(key) {
            Some(entry) if entry.generation == generation && entry.ref_count == 0 => {
                entries.remove(key)
            }
            _ => None,
        }
    };

    if let Some(entry) = evicted {
        debug!("Pool evicted {}", key);
        if let Some(on_delete) = &inner.options.on_delete {
            on_delete(key, entry.object);
        }
    }
    true
}

/// One reference to a pooled object. Released on drop.
pub struct PoolRef<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    pool: Arc<PoolInner<K, T>>,
    key: K,
    object: T,
    generation: u64,
    released: bool,
}

impl<K, T> PoolRef<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn object(&self) -> &T {
        &self.object
    }

    /// Release this reference now instead of at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            release(&self.pool, &self.key, self.generation);
        }
    }
}

impl<K, T> Deref for PoolRef<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<K, T> Drop for PoolRef<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    fn drop(&mut self) {
        self.release_once();
    }
}

impl<K, T> fmt::Debug for PoolRef<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRef")
            .field("key", &self.key.to_string())
            .field("generation", &self.generation)
            .finish()
    }
}
