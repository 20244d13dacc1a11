//! Bounded LRU cache of live sandboxes.
//!
//! Entries are looked up under one mutex that is never held across an await.
//! Construction happens outside the lock inside a per-entry
//! [`tokio::sync::OnceCell`], so concurrent misses on the same key join a
//! single build instead of racing to register two sandboxes.
//!
//! Every entry keeps the full [`SandboxIdentity`] it was built for. A lookup
//! whose identity differs from the stored one is a key collision and is
//! served by rebuilding, never by the stored sandbox.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::error::SandboxError;
use crate::key::{CacheKey, SandboxIdentity};
use crate::SandboxHandle;

/// Default population of the API-execution cache.
pub const DEFAULT_API_CACHE_SIZE: usize = 100;
/// Default population of the search cache. Search sandboxes embed the whole
/// snapshot, so this is kept small.
pub const DEFAULT_SEARCH_CACHE_SIZE: usize = 10;

/// Counters for cache activity.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Lookups served by an existing entry.
    pub hits: AtomicU64,
    /// Lookups that created a new entry.
    pub misses: AtomicU64,
    /// Entries pushed out to make room.
    pub evictions: AtomicU64,
    /// Lookups whose key matched an entry built for another identity.
    pub collisions: AtomicU64,
    /// Entries dropped because their sandbox had been retired.
    pub retired: AtomicU64,
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served by an existing entry.
    pub hits: u64,
    /// Lookups that created a new entry.
    pub misses: u64,
    /// Entries pushed out to make room.
    pub evictions: u64,
    /// Key collisions detected.
    pub collisions: u64,
    /// Entries dropped because their sandbox had been retired.
    pub retired: u64,
}

impl CacheMetrics {
    /// Read all counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
        }
    }
}

struct Slot {
    identity: SandboxIdentity,
    cell: OnceCell<Arc<dyn SandboxHandle>>,
}

impl Slot {
    fn empty(identity: SandboxIdentity) -> Arc<Self> {
        Arc::new(Self {
            identity,
            cell: OnceCell::new(),
        })
    }

    fn filled(identity: SandboxIdentity, handle: Arc<dyn SandboxHandle>) -> Arc<Self> {
        Arc::new(Self {
            identity,
            cell: OnceCell::new_with(Some(handle)),
        })
    }

    fn is_retired(&self) -> bool {
        self.cell.get().is_some_and(|h| h.is_retired())
    }
}

/// LRU cache mapping keys to live sandbox handles.
pub struct SandboxCache {
    name: &'static str,
    capacity: NonZeroUsize,
    entries: Mutex<LruCache<CacheKey, Arc<Slot>>>,
    metrics: CacheMetrics,
}

impl SandboxCache {
    /// Create a cache holding at most `capacity` sandboxes (at least one).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            capacity,
            entries: Mutex::new(LruCache::new(capacity)),
            metrics: CacheMetrics::default(),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum population.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Current population, including entries still being built.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Activity counters.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Look up a ready sandbox, promoting it to most-recently-used.
    ///
    /// Returns `None` when the key is absent, still being built, bound to a
    /// different identity, or when its sandbox was retired (the entry is
    /// dropped in that case).
    pub fn get(&self, key: &CacheKey, identity: &SandboxIdentity) -> Option<Arc<dyn SandboxHandle>> {
        let mut entries = self.lock();
        let slot = entries.get(key)?.clone();

        if slot.identity != *identity {
            self.metrics.collisions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(cache = self.name, key = %key, "cache key collision");
            return None;
        }
        if slot.is_retired() {
            entries.pop(key);
            self.metrics.retired.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let handle = slot.cell.get().cloned();
        if handle.is_some() {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        }
        handle
    }

    /// Insert or replace the entry for `key` and promote it, evicting the
    /// least-recently-used entry if the cache is full.
    pub fn set(&self, key: CacheKey, identity: SandboxIdentity, handle: Arc<dyn SandboxHandle>) {
        let mut entries = self.lock();
        self.push(&mut entries, key, Slot::filled(identity, handle));
    }

    /// Return the cached sandbox for `key`, building it with `build` on a miss.
    ///
    /// Concurrent callers for the same key and identity share one build. A
    /// failed build leaves nothing behind in the cache.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &CacheKey,
        identity: &SandboxIdentity,
        build: F,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn SandboxHandle>, SandboxError>>,
    {
        let slot = self.slot_for(key, identity);

        match slot.cell.get_or_try_init(build).await {
            Ok(handle) => {
                let handle = handle.clone();
                self.keep_resident(key, &slot);
                Ok(handle)
            }
            Err(e) => {
                self.discard(key, &slot);
                tracing::warn!(cache = self.name, key = %key, error = %e, "sandbox build failed");
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, Arc<Slot>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot_for(&self, key: &CacheKey, identity: &SandboxIdentity) -> Arc<Slot> {
        let mut entries = self.lock();

        if let Some(existing) = entries.get(key) {
            if existing.identity != *identity {
                self.metrics.collisions.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(cache = self.name, key = %key, "cache key collision, rebuilding");
            } else if existing.is_retired() {
                self.metrics.retired.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = self.name, key = %key, "cached sandbox retired, rebuilding");
            } else {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = self.name, key = %key, "cache hit");
                return existing.clone();
            }
        }

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let slot = Slot::empty(identity.clone());
        self.push(&mut entries, key.clone(), slot.clone());
        slot
    }

    fn push(
        &self,
        entries: &mut LruCache<CacheKey, Arc<Slot>>,
        key: CacheKey,
        slot: Arc<Slot>,
    ) {
        if let Some((evicted, _)) = entries.push(key.clone(), slot) {
            if evicted != key {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = self.name, key = %evicted, "evicted least-recently-used sandbox");
            }
        }
    }

    // A slot can be pushed out while its build is running; the finished
    // sandbox is then re-registered as the most recent entry.
    fn keep_resident(&self, key: &CacheKey, slot: &Arc<Slot>) {
        let mut entries = self.lock();
        if entries.peek(key).is_none() {
            self.push(&mut entries, key.clone(), slot.clone());
        }
    }

    fn discard(&self, key: &CacheKey, slot: &Arc<Slot>) {
        let mut entries = self.lock();
        let ours = entries
            .peek(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.cell.get().is_none());
        if ours {
            entries.pop(key);
        }
    }
}
