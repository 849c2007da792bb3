//! Reference-counted cache of shared, expensive resources
//!
//! Values are handed out as `Arc<T>` and counted per entry. When the last user
//! releases a value the entry is kept alive for a release delay; an acquire
//! during that window reuses it, otherwise a deferred task destroys it.
//!
//! ```ignore
//! let cache = Arc::new(
//!     RefCountedCache::new(|key: String| async move { Ok(Arc::new(open(&key).await?)) }.boxed())
//!         .with_destroy(|conn| conn.close())
//!         .with_release_delay(Duration::from_millis(250)),
//! );
//!
//! let conn = cache.acquire(&"db-1".to_string()).await?;
//! // ...
//! cache.release(&conn);
//! ```

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::common::ConnectorResult;

type CreateFn<K, T> = dyn Fn(K) -> BoxFuture<'static, ConnectorResult<Arc<T>>> + Send + Sync;
type DestroyFn<T> = dyn Fn(Arc<T>) + Send + Sync;
type KeysFn<K, T> = dyn Fn(&K, &T) -> HashSet<K> + Send + Sync;

struct CachedEntry<K, T> {
    value: Arc<T>,
    ref_count: usize,
    released_at: Option<Instant>,
    release_delay: Duration,
    keys: HashSet<K>,
    /// Bumped on every acquire and release so stale deferred evictions are ignored
    generation: u64,
}

struct CacheState<K, T> {
    index: HashMap<K, u64>,
    entries: HashMap<u64, CachedEntry<K, T>>,
    next_id: u64,
    shut_down: bool,
}

impl<K: Eq + Hash, T> CacheState<K, T> {
    fn entry_mut(&mut self, key: &K) -> Option<&mut CachedEntry<K, T>> {
        let id = *self.index.get(key)?;
        self.entries.get_mut(&id)
    }

    fn id_of(&self, value: &Arc<T>) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, entry)| Arc::ptr_eq(&entry.value, value))
            .map(|(id, _)| *id)
    }

    fn remove(&mut self, id: u64) -> Option<CachedEntry<K, T>> {
        let entry = self.entries.remove(&id)?;
        for key in &entry.keys {
            if self.index.get(key) == Some(&id) {
                self.index.remove(key);
            }
        }
        Some(entry)
    }
}

/// Keyed cache of `Arc<T>` values with usage counting and delayed destruction
///
/// Only the index is guarded by the mutex; `create` and `destroy` always run
/// outside of it.
pub struct RefCountedCache<K, T> {
    state: Mutex<CacheState<K, T>>,
    create: Box<CreateFn<K, T>>,
    destroy: Box<DestroyFn<T>>,
    alternative_keys: Box<KeysFn<K, T>>,
    release_delay: Duration,
}

impl<K, T> RefCountedCache<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Create a cache that builds missing values with `create`
    ///
    /// Defaults: values are simply dropped on destroy, no alternative keys,
    /// zero release delay.
    pub fn new<F>(create: F) -> Self
    where
        F: Fn(K) -> BoxFuture<'static, ConnectorResult<Arc<T>>> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(CacheState {
                index: HashMap::new(),
                entries: HashMap::new(),
                next_id: 0,
                shut_down: false,
            }),
            create: Box::new(create),
            destroy: Box::new(|_| {}),
            alternative_keys: Box::new(|_, _| HashSet::new()),
            release_delay: Duration::ZERO,
        }
    }

    /// Set the function called with a value when its entry is destroyed
    pub fn with_destroy<F>(mut self, destroy: F) -> Self
    where
        F: Fn(Arc<T>) + Send + Sync + 'static,
    {
        self.destroy = Box::new(destroy);
        self
    }

    /// Set the function listing extra keys under which a new value is reachable
    pub fn with_alternative_keys<F>(mut self, keys: F) -> Self
    where
        F: Fn(&K, &T) -> HashSet<K> + Send + Sync + 'static,
    {
        self.alternative_keys = Box::new(keys);
        self
    }

    /// Set the default time an unused entry survives before destruction
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the value cached under `key`, building it on a miss
    ///
    /// A hit increments the entry's reference count and cancels any pending
    /// destruction. Construction errors propagate and leave no entry behind.
    pub async fn acquire(&self, key: &K) -> ConnectorResult<Arc<T>> {
        if let Some(value) = self.acquire_existing(key) {
            debug!(key = ?key, "Cache hit");
            return Ok(value);
        }

        debug!(key = ?key, "Cache miss, creating value");
        let value = (self.create)(key.clone()).await?;
        let mut keys = (self.alternative_keys)(key, &value);
        keys.insert(key.clone());

        let mut state = self.lock();

        // Lost a race with another acquirer of the same key: share theirs.
        if let Some(entry) = state.entry_mut(key) {
            entry.ref_count += 1;
            entry.generation += 1;
            entry.released_at = None;
            let existing = Arc::clone(&entry.value);
            drop(state);
            debug!(key = ?key, "Discarding concurrently created duplicate");
            (self.destroy)(value);
            return Ok(existing);
        }

        let id = state.next_id;
        state.next_id += 1;

        let keys: HashSet<K> = keys
            .into_iter()
            .filter(|k| !state.index.contains_key(k))
            .collect();
        for k in &keys {
            state.index.insert(k.clone(), id);
        }
        debug!(key = ?key, aliases = keys.len(), "Cached new value");

        state.entries.insert(
            id,
            CachedEntry {
                value: Arc::clone(&value),
                ref_count: 1,
                released_at: None,
                release_delay: self.release_delay,
                keys,
                generation: 0,
            },
        );

        Ok(value)
    }

    fn acquire_existing(&self, key: &K) -> Option<Arc<T>> {
        let mut state = self.lock();
        let entry = state.entry_mut(key)?;
        entry.ref_count += 1;
        entry.generation += 1;
        entry.released_at = None;
        Some(Arc::clone(&entry.value))
    }

    /// Release a value using the cache-wide release delay
    pub fn release(self: &Arc<Self>, value: &Arc<T>) {
        self.release_with_delay(value, self.release_delay);
    }

    /// Release a value; destroy it after `delay` unless re-acquired meanwhile
    ///
    /// Outside a tokio runtime, or after [`shutdown`](Self::shutdown), an entry
    /// whose count drops to zero is destroyed right away.
    pub fn release_with_delay(self: &Arc<Self>, value: &Arc<T>, delay: Duration) {
        let mut state = self.lock();
        let shut_down = state.shut_down;

        let Some(id) = state.id_of(value) else {
            warn!("Released a value that is not owned by the cache");
            return;
        };
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        if entry.ref_count == 0 {
            warn!("Release without a matching acquire");
            return;
        }

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        entry.released_at = Some(Instant::now());
        entry.release_delay = delay;
        entry.generation += 1;
        let generation = entry.generation;

        let runtime = tokio::runtime::Handle::try_current().ok();
        if delay.is_zero() || shut_down || runtime.is_none() {
            let removed = state.remove(id);
            drop(state);
            self.destroy_entries(removed);
            return;
        }
        drop(state);

        if let Some(handle) = runtime {
            let cache = Arc::clone(self);
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                cache.evict_if_idle(id, generation);
            });
        }
    }

    fn evict_if_idle(&self, id: u64, generation: u64) {
        let mut state = self.lock();
        let idle = state.entries.get(&id).is_some_and(|entry| {
            entry.ref_count == 0
                && entry.generation == generation
                && entry
                    .released_at
                    .is_some_and(|at| at.elapsed() >= entry.release_delay)
        });
        if !idle {
            return;
        }
        let removed = state.remove(id);
        drop(state);
        self.destroy_entries(removed);
    }

    /// Destroy every unused entry whose release delay has elapsed
    ///
    /// Returns the number of destroyed entries.
    pub fn evict_idle(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.ref_count == 0
                    && entry
                        .released_at
                        .is_some_and(|at| at.elapsed() >= entry.release_delay)
            })
            .map(|(id, _)| *id)
            .collect();
        let removed: Vec<_> = expired.into_iter().filter_map(|id| state.remove(id)).collect();
        drop(state);

        let count = removed.len();
        self.destroy_entries(removed);
        count
    }

    /// Destroy all entries regardless of their reference counts
    ///
    /// Meant for process teardown. The cache stays usable afterwards, but
    /// releases no longer defer destruction.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        state.index.clear();
        let entries: Vec<_> = state.entries.drain().map(|(_, entry)| entry).collect();
        drop(state);

        info!(entries = entries.len(), "Shutting down resource cache");
        self.destroy_entries(entries);
    }

    fn destroy_entries(&self, entries: impl IntoIterator<Item = CachedEntry<K, T>>) {
        for entry in entries {
            debug!(keys = entry.keys.len(), "Destroying cached value");
            (self.destroy)(entry.value);
        }
    }

    /// Whether `key` currently resolves to a cached value
    pub fn contains(&self, key: &K) -> bool {
        self.lock().index.contains_key(key)
    }

    /// Current reference count of the entry reachable under `key`
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.lock().entry_mut(key).map(|entry| entry.ref_count)
    }

    /// Number of live entries (not keys)
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
