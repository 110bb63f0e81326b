//! Unit-of-work scopes and cache tier selection.
//!
//! Every cache policy call receives the caller's [`ScopeContext`]. The
//! [`ScopeCacheSelector`] reads the scope's declared cache mode and resolves
//! it to an [`ActiveTier`]: the shared global cache, the scope's own isolated
//! cache, or no cache at all.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use canopy_core::{new_scope_id, CacheConfig, CacheMode, CanopyResult, EntityKind, ScopeId};
use tracing::{debug, error};

use super::tier::{CacheRegistry, MemoryCache};
use super::traits::{CacheKey, CacheableEntity};

/// Global-tier eviction recorded by an isolated scope, run on completion.
pub type DeferredEviction = Box<dyn FnOnce() + Send>;

/// What a cache policy needs to know about the caller's unit of work.
pub trait ScopeContext: Send + Sync {
    fn scope_id(&self) -> ScopeId;

    /// Raw cache mode as declared by the scope subsystem.
    fn declared_cache_mode(&self) -> &str;

    /// Caches private to this scope.
    fn isolated_caches(&self) -> &CacheRegistry;

    /// Queue a global-tier eviction to run when the scope completes.
    fn defer_global_eviction(&self, eviction: DeferredEviction);
}

// ============================================================================
// UNIT OF WORK
// ============================================================================

/// In-process unit of work.
///
/// Isolated caches are shared with nested scopes. Deferred global evictions
/// run when the outermost scope is completed and are discarded if it is
/// dropped without completing.
pub struct UnitOfWork {
    id: ScopeId,
    mode: String,
    caches: Arc<CacheRegistry>,
    deferred: Arc<Mutex<Vec<DeferredEviction>>>,
    nested: bool,
    completed: AtomicBool,
}

impl UnitOfWork {
    pub fn new(mode: CacheMode, config: &CacheConfig) -> Self {
        Self::with_declared_mode(mode.as_db_str(), config)
    }

    /// Unit of work carrying a mode string exactly as the scope subsystem
    /// supplied it. An unknown mode surfaces on the first cache lookup.
    pub fn with_declared_mode(mode: impl Into<String>, config: &CacheConfig) -> Self {
        let uow = Self {
            id: new_scope_id(),
            mode: mode.into(),
            caches: Arc::new(CacheRegistry::new(config.max_entries_per_type)),
            deferred: Arc::new(Mutex::new(Vec::new())),
            nested: false,
            completed: AtomicBool::new(false),
        };
        debug!(scope_id = %uow.id, mode = %uow.mode, "unit of work started");
        uow
    }

    /// Inner scope sharing this scope's mode, isolated caches and deferred
    /// evictions. Completing it does not flush anything.
    pub fn nested(&self) -> Self {
        Self {
            id: new_scope_id(),
            mode: self.mode.clone(),
            caches: Arc::clone(&self.caches),
            deferred: Arc::clone(&self.deferred),
            nested: true,
            completed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Number of global evictions waiting for completion.
    pub fn pending_evictions(&self) -> usize {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Commit the unit of work: run deferred global evictions (outermost
    /// scope only) and release the isolated caches.
    pub fn complete(self) {
        self.completed.store(true, Ordering::Release);
        if self.nested {
            return;
        }

        let deferred: Vec<DeferredEviction> = {
            let mut guard = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        debug!(scope_id = %self.id, evictions = deferred.len(), "unit of work completed");
        for eviction in deferred {
            eviction();
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("nested", &self.nested)
            .field("pending_evictions", &self.pending_evictions())
            .finish()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.nested && !self.completed.load(Ordering::Acquire) {
            let discarded = self
                .deferred
                .lock()
                .map(|mut guard| {
                    let n = guard.len();
                    guard.clear();
                    n
                })
                .unwrap_or(0);
            debug!(scope_id = %self.id, discarded, "unit of work rolled back");
        }
    }
}

impl ScopeContext for UnitOfWork {
    fn scope_id(&self) -> ScopeId {
        self.id
    }

    fn declared_cache_mode(&self) -> &str {
        &self.mode
    }

    fn isolated_caches(&self) -> &CacheRegistry {
        &self.caches
    }

    fn defer_global_eviction(&self, eviction: DeferredEviction) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(eviction);
    }
}

// ============================================================================
// TIER SELECTION
// ============================================================================

/// Tier kind, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Global,
    Isolated,
    Bypass,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TierKind::Global => "global",
            TierKind::Isolated => "isolated",
            TierKind::Bypass => "bypass",
        };
        f.write_str(s)
    }
}

/// Cache tier a policy call runs against.
pub enum ActiveTier<K, T> {
    Global(Arc<MemoryCache<K, T>>),
    Isolated {
        scope_id: ScopeId,
        cache: Arc<MemoryCache<K, T>>,
    },
    Bypass,
}

impl<K, T> ActiveTier<K, T> {
    pub fn kind(&self) -> TierKind {
        match self {
            ActiveTier::Global(_) => TierKind::Global,
            ActiveTier::Isolated { .. } => TierKind::Isolated,
            ActiveTier::Bypass => TierKind::Bypass,
        }
    }

    /// Backing cache, `None` when bypassing.
    pub fn cache(&self) -> Option<&Arc<MemoryCache<K, T>>> {
        match self {
            ActiveTier::Global(cache) | ActiveTier::Isolated { cache, .. } => Some(cache),
            ActiveTier::Bypass => None,
        }
    }
}

impl<K, T> fmt::Debug for ActiveTier<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveTier::Isolated { scope_id, .. } => f
                .debug_struct("Isolated")
                .field("scope_id", scope_id)
                .finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// Resolves a scope's declared cache mode to a tier.
#[derive(Debug, Clone)]
pub struct ScopeCacheSelector {
    global: Arc<CacheRegistry>,
}

impl ScopeCacheSelector {
    pub fn new(global: Arc<CacheRegistry>) -> Self {
        Self { global }
    }

    /// Selector with its own global registry.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Arc::new(CacheRegistry::new(config.max_entries_per_type)))
    }

    /// Tier for `kind` entities of type `T` within `scope`.
    ///
    /// Fails with `UnsupportedMode` if the scope declares a mode other than
    /// `default`, `scoped` or `none`.
    pub fn select<K, T>(
        &self,
        scope: &dyn ScopeContext,
        kind: EntityKind,
    ) -> CanopyResult<ActiveTier<K, T>>
    where
        K: CacheKey,
        T: CacheableEntity<K>,
    {
        let declared = scope.declared_cache_mode();
        let mode: CacheMode = declared.parse().map_err(|e| {
            error!(scope_id = %scope.scope_id(), mode = declared, "unsupported repository cache mode");
            e
        })?;

        Ok(match mode {
            CacheMode::Default => ActiveTier::Global(self.global.get_or_create::<K, T>(kind)),
            CacheMode::Scoped => ActiveTier::Isolated {
                scope_id: scope.scope_id(),
                cache: scope.isolated_caches().get_or_create::<K, T>(kind),
            },
            CacheMode::None => ActiveTier::Bypass,
        })
    }

    /// Global cache for `kind` entities of type `T`, regardless of any scope.
    pub fn global_cache<K, T>(&self, kind: EntityKind) -> Arc<MemoryCache<K, T>>
    where
        K: CacheKey,
        T: CacheableEntity<K>,
    {
        self.global.get_or_create::<K, T>(kind)
    }

    pub fn global_registry(&self) -> &Arc<CacheRegistry> {
        &self.global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{CanopyError, ConfigError, DataType, NodeId};
    use std::sync::atomic::AtomicUsize;

    fn selector() -> ScopeCacheSelector {
        ScopeCacheSelector::from_config(&CacheConfig::default())
    }

    #[test]
    fn test_select_by_mode() {
        let selector = selector();
        let config = CacheConfig::default();

        let uow = UnitOfWork::new(CacheMode::Default, &config);
        let tier = selector.select::<NodeId, DataType>(&uow, EntityKind::DataType).unwrap();
        assert_eq!(tier.kind(), TierKind::Global);

        let uow = UnitOfWork::new(CacheMode::Scoped, &config);
        let tier = selector.select::<NodeId, DataType>(&uow, EntityKind::DataType).unwrap();
        assert!(matches!(tier, ActiveTier::Isolated { scope_id, .. } if scope_id == uow.id()));

        let uow = UnitOfWork::new(CacheMode::None, &config);
        let tier = selector.select::<NodeId, DataType>(&uow, EntityKind::DataType).unwrap();
        assert!(tier.cache().is_none());
    }

    #[test]
    fn test_declared_mode_is_case_insensitive() {
        let uow = UnitOfWork::with_declared_mode("Scoped", &CacheConfig::default());
        let tier = selector().select::<NodeId, DataType>(&uow, EntityKind::DataType).unwrap();
        assert_eq!(tier.kind(), TierKind::Isolated);
    }

    #[test]
    fn test_unsupported_mode_is_fatal() {
        let uow = UnitOfWork::with_declared_mode("sticky", &CacheConfig::default());
        let err = selector().select::<NodeId, DataType>(&uow, EntityKind::DataType).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err,
            CanopyError::Config(ConfigError::UnsupportedMode {
                mode: "sticky".to_string()
            })
        );
    }

    #[test]
    fn test_isolated_caches_are_per_unit_of_work() {
        let selector = selector();
        let config = CacheConfig::default();
        let a = UnitOfWork::new(CacheMode::Scoped, &config);
        let b = UnitOfWork::new(CacheMode::Scoped, &config);

        let tier_a = selector.select::<NodeId, DataType>(&a, EntityKind::DataType).unwrap();
        let tier_b = selector.select::<NodeId, DataType>(&b, EntityKind::DataType).unwrap();
        let (Some(cache_a), Some(cache_b)) = (tier_a.cache(), tier_b.cache()) else {
            panic!("isolated tiers must have a cache");
        };
        assert!(!Arc::ptr_eq(cache_a, cache_b));

        // Nested scopes see the outer scope's isolated entries.
        let inner = a.nested();
        let tier_inner = selector.select::<NodeId, DataType>(&inner, EntityKind::DataType).unwrap();
        assert!(Arc::ptr_eq(cache_a, tier_inner.cache().unwrap()));
    }

    #[test]
    fn test_deferred_evictions_run_on_complete() {
        let runs = Arc::new(AtomicUsize::new(0));
        let uow = UnitOfWork::new(CacheMode::Scoped, &CacheConfig::default());

        let inner = uow.nested();
        let counter = Arc::clone(&runs);
        inner.defer_global_eviction(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        inner.complete();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(uow.pending_evictions(), 1);

        uow.complete();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_evictions_discarded_on_rollback() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let uow = UnitOfWork::new(CacheMode::Scoped, &CacheConfig::default());
            let counter = Arc::clone(&runs);
            uow.defer_global_eviction(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
