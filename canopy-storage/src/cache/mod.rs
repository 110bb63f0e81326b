//! Scoped repository cache.
//!
//! Repositories read through a [`CachePolicy`], which picks its cache tier
//! per call from the caller's [`ScopeContext`]:
//!
//! - `default`: the process-wide global tier, shared by every unit of work
//! - `scoped`: a tier private to the unit of work, dropped with it
//! - `none`: no caching at all
//!
//! Writes evict rather than overwrite. An eviction that races a fill in
//! progress always wins: fills carry a [`Watermark`] taken before the
//! repository call and are discarded if the key was evicted after it.
//!
//! # Example
//!
//! ```ignore
//! let selector = ScopeCacheSelector::from_config(&config.cache);
//! let policy = CachePolicy::<NodeId, DataType>::new(EntityKind::DataType, selector);
//!
//! let uow = UnitOfWork::new(CacheMode::Scoped, &config.cache);
//! let data_type = policy.get(&uow, id, &repository).await?;
//! uow.complete();
//! ```

pub mod policy;
pub mod scope;
pub mod tier;
pub mod traits;
pub mod watermark;

pub use policy::CachePolicy;
pub use scope::{
    ActiveTier, DeferredEviction, ScopeCacheSelector, ScopeContext, TierKind, UnitOfWork,
};
pub use tier::{CacheRegistry, MemoryCache};
pub use traits::{CacheKey, CacheStats, CacheableEntity, EntityFetcher, EntityPersister};
pub use watermark::{InvalidationClock, Watermark};
