//! In-memory cache tiers.
//!
//! A [`MemoryCache`] holds the entries of one entity kind. A
//! [`CacheRegistry`] hands out one `MemoryCache` per entity type and kind and
//! is used both for the global tier and for every unit of work's isolated
//! tier.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use canopy_core::EntityKind;
use tracing::{debug, warn};

use super::traits::{CacheKey, CacheStats, CacheableEntity};
use super::watermark::{InvalidationClock, Watermark};

#[derive(Debug)]
struct Entries<K, T> {
    values: HashMap<K, T>,
    /// Watermark of the latest invalidation per key.
    tombstones: HashMap<K, Watermark>,
    /// Fills taken before this are refused for every key. Raised by `clear`
    /// and when old tombstones are pruned.
    floor: Watermark,
}

impl<K, T> Default for Entries<K, T> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            tombstones: HashMap::new(),
            floor: Watermark::zero(),
        }
    }
}

/// Cache of one entity kind.
///
/// Lookups take a short read lock and never block on I/O. Lock poisoning is
/// recovered from: every mutation leaves the maps consistent.
///
/// At most `capacity` tombstones are kept. When there are more, the older
/// half is folded into the floor watermark, which refuses a superset of the
/// fills those tombstones refused.
#[derive(Debug)]
pub struct MemoryCache<K, T> {
    entries: RwLock<Entries<K, T>>,
    clock: InvalidationClock,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    discarded_fills: AtomicU64,
}

impl<K, T> MemoryCache<K, T>
where
    K: CacheKey,
    T: CacheableEntity<K>,
{
    /// Create an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            clock: InvalidationClock::new(),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            discarded_fills: AtomicU64::new(0),
        }
    }

    /// Look up a cached copy.
    pub fn get(&self, key: &K) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let found = entries.values.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// True if the key is cached. Does not count as a hit or miss.
    pub fn contains(&self, key: &K) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values.contains_key(key)
    }

    /// Watermark to pass to [`insert`](Self::insert) for a fill that is
    /// about to call the repository.
    pub fn begin_fill(&self) -> Watermark {
        self.clock.current()
    }

    /// Insert a fetched value.
    ///
    /// Returns false (and stores nothing) if the key was invalidated or the
    /// cache cleared after `watermark` was taken.
    pub fn insert(&self, key: K, value: T, watermark: Watermark) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let invalidated_after = entries
            .tombstones
            .get(&key)
            .is_some_and(|tombstone| tombstone.is_newer_than(&watermark));
        if invalidated_after || entries.floor.is_newer_than(&watermark) {
            self.discarded_fills.fetch_add(1, Ordering::Relaxed);
            warn!(key = ?key, "discarding cache fill raced by an invalidation");
            return false;
        }

        if !entries.values.contains_key(&key) && entries.values.len() >= self.capacity {
            if let Some(victim) = entries.values.keys().next().copied() {
                entries.values.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                warn!(victim = ?victim, capacity = self.capacity, "cache full, evicted entry");
            }
        }
        entries.values.insert(key, value);
        true
    }

    /// Evict one key. Any fill that started before this call is discarded.
    pub fn remove(&self, key: &K) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let watermark = self.clock.advance();
        entries.tombstones.insert(*key, watermark);
        self.prune_tombstones(&mut entries);
        let removed = entries.values.remove(key).is_some();
        debug!(key = ?key, removed, "invalidated cache entry");
        removed
    }

    fn prune_tombstones(&self, entries: &mut Entries<K, T>) {
        if entries.tombstones.len() <= self.capacity {
            return;
        }
        let mut marks: Vec<Watermark> = entries.tombstones.values().copied().collect();
        marks.sort_unstable();
        let keep = self.capacity / 2;
        let floor = marks[marks.len() - keep - 1];
        entries.tombstones.retain(|_, mark| mark.is_newer_than(&floor));
        if floor.is_newer_than(&entries.floor) {
            entries.floor = floor;
        }
        debug!(floor = floor.sequence, kept = entries.tombstones.len(), "pruned tombstones");
    }

    /// Evict everything. Returns the number of entries removed.
    pub fn clear(&self) -> u64 {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let watermark = self.clock.advance();
        let removed = entries.values.len() as u64;
        entries.values.clear();
        entries.tombstones.clear();
        entries.floor = watermark;
        removed
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
            discarded_fills: self.discarded_fills.load(Ordering::Relaxed),
        }
    }
}

/// Kind-agnostic view of a [`MemoryCache`], for operations that span every
/// cache of a registry.
trait TierCache: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Evict every key of `keys` (a `Vec<K>`) if this cache is keyed by `K`.
    fn remove_keys(&self, keys: &dyn Any) -> usize;

    fn clear_entries(&self) -> u64;
}

impl<K, T> TierCache for MemoryCache<K, T>
where
    K: CacheKey,
    T: CacheableEntity<K>,
{
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn remove_keys(&self, keys: &dyn Any) -> usize {
        keys.downcast_ref::<Vec<K>>()
            .map_or(0, |keys| keys.iter().filter(|key| self.remove(key)).count())
    }

    fn clear_entries(&self) -> u64 {
        self.clear()
    }
}

type CacheSlot = (TypeId, EntityKind);

/// One [`MemoryCache`] per entity type and kind, created on first access.
///
/// Kinds sharing a Rust type (every container kind is an
/// `EntityContainer`) get separate caches.
pub struct CacheRegistry {
    caches: RwLock<HashMap<CacheSlot, Arc<dyn TierCache>>>,
    capacity: usize,
}

impl CacheRegistry {
    /// Create a registry whose caches hold at most `capacity` entries each.
    pub fn new(capacity: usize) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// The cache for `kind` entities of type `T`, created if this is the
    /// first access.
    pub fn get_or_create<K, T>(&self, kind: EntityKind) -> Arc<MemoryCache<K, T>>
    where
        K: CacheKey,
        T: CacheableEntity<K>,
    {
        let slot_key = (TypeId::of::<MemoryCache<K, T>>(), kind);

        {
            let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cache) = caches.get(&slot_key) {
                if let Ok(cache) = Arc::clone(cache).into_any().downcast::<MemoryCache<K, T>>() {
                    return cache;
                }
            }
        }

        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        let slot = caches.entry(slot_key).or_insert_with(|| -> Arc<dyn TierCache> {
            Arc::new(MemoryCache::<K, T>::new(self.capacity))
        });
        match Arc::clone(slot).into_any().downcast::<MemoryCache<K, T>>() {
            Ok(cache) => cache,
            Err(_) => {
                let cache = Arc::new(MemoryCache::<K, T>::new(self.capacity));
                *slot = Arc::clone(&cache) as Arc<dyn TierCache>;
                cache
            }
        }
    }

    /// Evict `keys` from every cache keyed by `K`, whatever its kind. Keys
    /// are node ids, unique across kinds. Returns the number of entries
    /// removed.
    pub fn remove_everywhere<K: CacheKey>(&self, keys: &[K]) -> usize {
        let keys = keys.to_vec();
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        caches.values().map(|cache| cache.remove_keys(&keys)).sum()
    }

    /// Evict every entry of every cache. Returns the number removed.
    pub fn clear_everything(&self) -> u64 {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        caches.values().map(|cache| cache.clear_entries()).sum()
    }

    /// Number of caches created so far.
    pub fn cache_count(&self) -> usize {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        caches.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("caches", &self.cache_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
