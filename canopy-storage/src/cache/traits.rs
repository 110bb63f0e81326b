//! Cacheable entity marker and the repository callbacks a cache policy
//! falls through to.

use async_trait::async_trait;
use canopy_core::{CanopyResult, DataType, EntityContainer, EntityKind, NodeId};
use std::fmt::Debug;
use std::hash::Hash;

/// Key type usable by the cache tiers.
pub trait CacheKey: Copy + Eq + Hash + Debug + ToString + Send + Sync + 'static {}

impl<K> CacheKey for K where K: Copy + Eq + Hash + Debug + ToString + Send + Sync + 'static {}

/// Marker trait for types that can be cached.
///
/// # Implementation Requirements
///
/// - `cache_key()` must return the store identity once the entity has been
///   persisted; the policy reads it after the persist callback ran
/// - Implementations must be `Clone` since tiers hand out copies
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait CacheableEntity<K: CacheKey>: Clone + Send + Sync + 'static {
    /// Get the entity kind of this instance.
    fn entity_kind(&self) -> EntityKind;

    /// Get the key this entity is cached under.
    fn cache_key(&self) -> K;
}

/// Read callbacks of the repository behind a cache policy.
///
/// `fetch_one` and `fetch_many` only ever return live entities. An empty
/// `ids` slice passed to `fetch_many` means "every entity".
#[async_trait]
pub trait EntityFetcher<K: CacheKey, T>: Send + Sync {
    /// Fetch one entity, `None` if it has no live row.
    async fn fetch_one(&self, id: K) -> CanopyResult<Option<T>>;

    /// Fetch several entities in one round trip. Missing ids are omitted.
    async fn fetch_many(&self, ids: &[K]) -> CanopyResult<Vec<T>>;

    /// Existence check that does not materialize the entity.
    async fn exists(&self, id: K) -> CanopyResult<bool>;
}

/// Write callbacks of the repository behind a cache policy.
///
/// Each call may mutate the entity (server assigned id, path, sort order)
/// and returns the keys of *other* entities whose stored state changed as a
/// side effect, so the policy can evict them too.
#[async_trait]
pub trait EntityPersister<K: CacheKey, T>: Send + Sync {
    async fn persist_new(&self, entity: &mut T) -> CanopyResult<Vec<K>>;

    async fn persist_updated(&self, entity: &mut T) -> CanopyResult<Vec<K>>;

    async fn persist_deleted(&self, entity: &mut T) -> CanopyResult<Vec<K>>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of fills discarded because an invalidation raced them.
    pub discarded_fills: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ============================================================================
// IMPLEMENTATIONS FOR CANOPY ENTITIES
// ============================================================================

impl CacheableEntity<NodeId> for DataType {
    fn entity_kind(&self) -> EntityKind {
        self.node.kind
    }

    fn cache_key(&self) -> NodeId {
        self.node.id
    }
}

impl CacheableEntity<NodeId> for EntityContainer {
    fn entity_kind(&self) -> EntityKind {
        self.node.kind
    }

    fn cache_key(&self) -> NodeId {
        self.node.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::ROOT_ID;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_cacheable_entity_kinds() {
        let mut dt = DataType::new("Label", "Canopy.Label");
        dt.node.id = 1051;
        assert_eq!(dt.entity_kind(), EntityKind::DataType);
        assert_eq!(dt.cache_key(), 1051);

        let folder = EntityContainer::new(EntityKind::DocumentTypeContainer, "Pages", ROOT_ID);
        assert_eq!(folder.entity_kind(), EntityKind::DocumentTypeContainer);
    }
}
