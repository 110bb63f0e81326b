//! Cache-aside policy in front of a repository.
//!
//! Reads are served from the tier selected for the caller's scope and fall
//! through to the repository on a miss. Writes go to the repository first
//! and then evict the written entity plus every entity the repository
//! reports as affected. Cached values are only ever removed on write, never
//! overwritten, so the next read always reflects the store.
//!
//! Affected keys are evicted from every cache of the tier, not only from the
//! policy's own: moving a folder relocates entities of other kinds, which
//! are cached by other policies.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use canopy_core::{CanopyResult, EntityKind, StorageError};
use tracing::{debug, trace, warn};

use super::scope::{ActiveTier, ScopeCacheSelector, ScopeContext};
use super::traits::{CacheKey, CacheStats, CacheableEntity, EntityFetcher, EntityPersister};

/// Read-through, invalidate-on-write cache policy for one entity kind.
pub struct CachePolicy<K, T> {
    kind: EntityKind,
    selector: ScopeCacheSelector,
    _entity: PhantomData<fn() -> (K, T)>,
}

impl<K, T> CachePolicy<K, T>
where
    K: CacheKey,
    T: CacheableEntity<K>,
{
    pub fn new(kind: EntityKind, selector: ScopeCacheSelector) -> Self {
        Self {
            kind,
            selector,
            _entity: PhantomData,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn selector(&self) -> &ScopeCacheSelector {
        &self.selector
    }

    fn select(&self, scope: &dyn ScopeContext) -> CanopyResult<ActiveTier<K, T>> {
        self.selector.select::<K, T>(scope, self.kind)
    }

    fn owns(&self, entity: &T) -> bool {
        entity.entity_kind() == self.kind
    }

    fn not_found(&self, id: K) -> StorageError {
        StorageError::NotFound {
            kind: self.kind,
            id: id.to_string(),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Cached copy of `id`, fetching and caching it on a miss.
    pub async fn get<F>(&self, scope: &dyn ScopeContext, id: K, fetcher: &F) -> CanopyResult<T>
    where
        F: EntityFetcher<K, T> + ?Sized,
    {
        let tier = self.select(scope)?;
        let Some(cache) = tier.cache() else {
            return fetcher
                .fetch_one(id)
                .await?
                .ok_or_else(|| self.not_found(id).into());
        };

        if let Some(hit) = cache.get(&id).filter(|hit| self.owns(hit)) {
            trace!(kind = %self.kind, id = ?id, tier = %tier.kind(), "cache hit");
            return Ok(hit);
        }

        let watermark = cache.begin_fill();
        debug!(kind = %self.kind, id = ?id, tier = %tier.kind(), "cache miss, fetching");
        let entity = fetcher
            .fetch_one(id)
            .await?
            .ok_or_else(|| self.not_found(id))?;
        cache.insert(id, entity.clone(), watermark);
        Ok(entity)
    }

    /// Tier lookup only; never calls the repository.
    pub fn get_cached(&self, scope: &dyn ScopeContext, id: K) -> CanopyResult<Option<T>> {
        let tier = self.select(scope)?;
        Ok(tier
            .cache()
            .and_then(|cache| cache.get(&id))
            .filter(|hit| self.owns(hit)))
    }

    /// True if `id` is cached or the repository reports it as live. Does not
    /// populate the cache.
    pub async fn exists<F>(&self, scope: &dyn ScopeContext, id: K, fetcher: &F) -> CanopyResult<bool>
    where
        F: EntityFetcher<K, T> + ?Sized,
    {
        let tier = self.select(scope)?;
        if tier.cache().is_some_and(|cache| cache.contains(&id)) {
            return Ok(true);
        }
        fetcher.exists(id).await
    }

    /// Entities for `ids`, each live id exactly once; missing ids are omitted.
    /// An empty `ids` slice fetches every entity.
    ///
    /// Misses are fetched with a single `fetch_many` call.
    pub async fn get_all<F>(
        &self,
        scope: &dyn ScopeContext,
        ids: &[K],
        fetcher: &F,
    ) -> CanopyResult<Vec<T>>
    where
        F: EntityFetcher<K, T> + ?Sized,
    {
        let tier = self.select(scope)?;

        if ids.is_empty() {
            let watermark = tier.cache().map(|cache| cache.begin_fill());
            let all = fetcher.fetch_many(&[]).await?;
            if let (Some(cache), Some(watermark)) = (tier.cache(), watermark) {
                for entity in &all {
                    cache.insert(entity.cache_key(), entity.clone(), watermark);
                }
            }
            debug!(kind = %self.kind, count = all.len(), tier = %tier.kind(), "fetched all");
            return Ok(all);
        }

        let mut seen = HashSet::with_capacity(ids.len());
        let unique: Vec<K> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let Some(cache) = tier.cache() else {
            return fetcher.fetch_many(&unique).await;
        };

        let mut found = Vec::with_capacity(unique.len());
        let mut missing = Vec::new();
        for id in unique {
            match cache.get(&id).filter(|hit| self.owns(hit)) {
                Some(hit) => found.push(hit),
                None => missing.push(id),
            }
        }

        if missing.is_empty() {
            return Ok(found);
        }

        let watermark = cache.begin_fill();
        debug!(kind = %self.kind, missing = missing.len(), tier = %tier.kind(), "fetching cache misses");
        let wanted: HashSet<K> = missing.iter().copied().collect();
        let mut fetched: HashMap<K, T> = HashMap::with_capacity(missing.len());
        for entity in fetcher.fetch_many(&missing).await? {
            let key = entity.cache_key();
            if wanted.contains(&key) {
                fetched.insert(key, entity);
            }
        }
        for (key, entity) in fetched {
            cache.insert(key, entity.clone(), watermark);
            found.push(entity);
        }
        Ok(found)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Persist a new entity, then evict it and everything it affected.
    pub async fn create<P>(
        &self,
        scope: &dyn ScopeContext,
        entity: &mut T,
        persister: &P,
    ) -> CanopyResult<()>
    where
        P: EntityPersister<K, T> + ?Sized,
    {
        let tier = self.select(scope)?;
        let affected = persister.persist_new(entity).await?;
        self.evict_written(scope, &tier, entity.cache_key(), affected);
        Ok(())
    }

    /// Persist changes to an entity, then evict it and everything it affected.
    pub async fn update<P>(
        &self,
        scope: &dyn ScopeContext,
        entity: &mut T,
        persister: &P,
    ) -> CanopyResult<()>
    where
        P: EntityPersister<K, T> + ?Sized,
    {
        let tier = self.select(scope)?;
        let affected = persister.persist_updated(entity).await?;
        self.evict_written(scope, &tier, entity.cache_key(), affected);
        Ok(())
    }

    /// Persist a deletion, then evict the entity and everything it affected.
    pub async fn delete<P>(
        &self,
        scope: &dyn ScopeContext,
        entity: &mut T,
        persister: &P,
    ) -> CanopyResult<()>
    where
        P: EntityPersister<K, T> + ?Sized,
    {
        let tier = self.select(scope)?;
        let affected = persister.persist_deleted(entity).await?;
        self.evict_written(scope, &tier, entity.cache_key(), affected);
        Ok(())
    }

    fn evict_written(
        &self,
        scope: &dyn ScopeContext,
        tier: &ActiveTier<K, T>,
        id: K,
        mut affected: Vec<K>,
    ) {
        affected.push(id);
        self.evict(scope, tier, &affected);
    }

    /// Evict `ids` from the active tier.
    pub fn invalidate(&self, scope: &dyn ScopeContext, ids: &[K]) -> CanopyResult<()> {
        let tier = self.select(scope)?;
        self.evict(scope, &tier, ids);
        Ok(())
    }

    fn evict(&self, scope: &dyn ScopeContext, tier: &ActiveTier<K, T>, ids: &[K]) {
        let removed = match tier {
            ActiveTier::Global(_) => self.selector.global_registry().remove_everywhere(ids),
            ActiveTier::Isolated { .. } => scope.isolated_caches().remove_everywhere(ids),
            ActiveTier::Bypass => 0,
        };
        debug!(kind = %self.kind, count = ids.len(), removed, tier = %tier.kind(), "invalidated");

        // Outside the global tier the shared cache learns about the write
        // only once the unit of work commits.
        if !matches!(tier, ActiveTier::Global(_)) {
            let global = Arc::clone(self.selector.global_registry());
            let ids = ids.to_vec();
            scope.defer_global_eviction(Box::new(move || {
                global.remove_everywhere(&ids);
            }));
        }
    }

    /// Evict every entry of this entity kind from the active tier. Other
    /// kinds are untouched. Returns the number of entries removed.
    pub fn clear_all(&self, scope: &dyn ScopeContext) -> CanopyResult<u64> {
        let tier = self.select(scope)?;
        let removed = match &tier {
            ActiveTier::Global(cache) => cache.clear(),
            ActiveTier::Isolated { cache, .. } => {
                let global = self.selector.global_cache::<K, T>(self.kind);
                scope.defer_global_eviction(Box::new(move || {
                    global.clear();
                }));
                cache.clear()
            }
            ActiveTier::Bypass => 0,
        };
        debug!(kind = %self.kind, removed, tier = %tier.kind(), "cleared cache");
        Ok(removed)
    }

    /// Evict every entry of every kind from the active tier, for writes that
    /// failed part way through a cascade. Returns the number of entries
    /// removed.
    pub fn clear_tier(&self, scope: &dyn ScopeContext) -> CanopyResult<u64> {
        let tier = self.select(scope)?;
        let removed = match &tier {
            ActiveTier::Global(_) => self.selector.global_registry().clear_everything(),
            ActiveTier::Isolated { .. } => scope.isolated_caches().clear_everything(),
            ActiveTier::Bypass => 0,
        };
        if !matches!(tier, ActiveTier::Global(_)) {
            let global = Arc::clone(self.selector.global_registry());
            scope.defer_global_eviction(Box::new(move || {
                global.clear_everything();
            }));
        }
        warn!(kind = %self.kind, removed, tier = %tier.kind(), "cleared every cache of the tier");
        Ok(removed)
    }

    /// Usage statistics of the active tier.
    pub fn stats(&self, scope: &dyn ScopeContext) -> CanopyResult<CacheStats> {
        let tier = self.select(scope)?;
        Ok(tier.cache().map(|cache| cache.stats()).unwrap_or_default())
    }
}

impl<K, T> Clone for CachePolicy<K, T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            selector: self.selector.clone(),
            _entity: PhantomData,
        }
    }
}

impl<K, T> std::fmt::Debug for CachePolicy<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
