//! Cached tree repository: the handle callers hold.
//!
//! Composes a [`TreeRepository`] with a [`CachePolicy`]. Every call takes the
//! caller's scope explicitly, reads go through the cache tier selected for
//! that scope, and writes evict every node the tree repository reports as
//! affected. Moves are published on a broadcast channel.
//!
//! A move or re-parent that fails after its checks passed may have written
//! part of a subtree, of any kind. Every cache of the active tier is cleared
//! before such an error is returned.

use std::sync::Arc;

use canopy_core::{CanopyConfig, CanopyError, CanopyResult, EntityKind, MoveEvent, Node, NodeId};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{CachePolicy, CacheStats, ScopeCacheSelector, ScopeContext};
use crate::tree::{TreeEntity, TreeRepository};
use crate::NodeStore;

const EVENT_CAPACITY: usize = 256;

pub struct CachedTreeRepository<T, S> {
    repository: TreeRepository<T, S>,
    policy: CachePolicy<NodeId, T>,
    moves: broadcast::Sender<MoveEvent<T>>,
}

impl<T, S> CachedTreeRepository<T, S>
where
    T: TreeEntity,
    S: NodeStore<T>,
{
    pub fn new(
        store: Arc<S>,
        kind: EntityKind,
        config: CanopyConfig,
        selector: ScopeCacheSelector,
    ) -> Self {
        let (moves, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            repository: TreeRepository::new(store, kind, config),
            policy: CachePolicy::new(kind, selector),
            moves,
        }
    }

    pub fn repository(&self) -> &TreeRepository<T, S> {
        &self.repository
    }

    pub fn policy(&self) -> &CachePolicy<NodeId, T> {
        &self.policy
    }

    /// Receive every move event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MoveEvent<T>> {
        self.moves.subscribe()
    }

    pub async fn get(&self, scope: &dyn ScopeContext, id: NodeId) -> CanopyResult<T> {
        self.policy.get(scope, id, &self.repository).await
    }

    pub fn get_cached(&self, scope: &dyn ScopeContext, id: NodeId) -> CanopyResult<Option<T>> {
        self.policy.get_cached(scope, id)
    }

    pub async fn exists(&self, scope: &dyn ScopeContext, id: NodeId) -> CanopyResult<bool> {
        self.policy.exists(scope, id, &self.repository).await
    }

    pub async fn get_all(&self, scope: &dyn ScopeContext, ids: &[NodeId]) -> CanopyResult<Vec<T>> {
        self.policy.get_all(scope, ids, &self.repository).await
    }

    pub async fn create(&self, scope: &dyn ScopeContext, entity: &mut T) -> CanopyResult<()> {
        self.policy.create(scope, entity, &self.repository).await
    }

    pub async fn update(&self, scope: &dyn ScopeContext, entity: &mut T) -> CanopyResult<()> {
        let id = entity.node().id;
        match self.policy.update(scope, entity, &self.repository).await {
            Err(err) => Err(self.after_failed_cascade(scope, id, err)),
            ok => ok,
        }
    }

    pub async fn delete(&self, scope: &dyn ScopeContext, entity: &mut T) -> CanopyResult<()> {
        self.policy.delete(scope, entity, &self.repository).await
    }

    /// Move `entity` under `new_parent` (root level for `None`), evict every
    /// relocated node of every kind and publish the move events.
    pub async fn move_node(
        &self,
        scope: &dyn ScopeContext,
        entity: &mut T,
        new_parent: Option<&Node>,
    ) -> CanopyResult<Vec<MoveEvent<T>>> {
        let moved = match self.repository.move_subtree(entity, new_parent).await {
            Ok(moved) => moved,
            Err(err) => return Err(self.after_failed_cascade(scope, entity.node().id, err)),
        };

        let ids: Vec<NodeId> = moved.affected_ids();
        self.policy.invalidate(scope, &ids)?;
        let events = moved.events;

        // Sending fails only when nobody is subscribed.
        let mut delivered = 0;
        for event in &events {
            if self.moves.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(id = entity.node().id, events = events.len(), delivered, "published move events");
        Ok(events)
    }

    /// Rejections leave the cache alone; a store write failure clears the
    /// tier.
    fn after_failed_cascade(
        &self,
        scope: &dyn ScopeContext,
        id: NodeId,
        err: CanopyError,
    ) -> CanopyError {
        if !err.is_write_failure() {
            return err;
        }
        warn!(id, error = %err, "write failed part way, clearing cache tier");
        match self.policy.clear_tier(scope) {
            Ok(_) => err,
            Err(clear_err) => {
                warn!(id, error = %clear_err, "could not clear cache tier");
                err
            }
        }
    }

    pub fn clear_all(&self, scope: &dyn ScopeContext) -> CanopyResult<u64> {
        self.policy.clear_all(scope)
    }

    pub fn stats(&self, scope: &dyn ScopeContext) -> CanopyResult<CacheStats> {
        self.policy.stats(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UnitOfWork;
    use crate::InMemoryNodeStore;
    use canopy_core::{CacheConfig, CacheMode, DataType, EntityContainer, NodePath, ROOT_ID};

    type Repo = CachedTreeRepository<DataType, InMemoryNodeStore<DataType>>;

    fn repo() -> Repo {
        CachedTreeRepository::new(
            Arc::new(InMemoryNodeStore::new()),
            EntityKind::DataType,
            CanopyConfig::default(),
            ScopeCacheSelector::from_config(&CacheConfig::default()),
        )
    }

    fn scope() -> UnitOfWork {
        UnitOfWork::new(CacheMode::Default, &CacheConfig::default())
    }

    async fn create(repo: &Repo, scope: &UnitOfWork, name: &str, parent_id: NodeId) -> DataType {
        let mut dt = DataType::new(name, "Canopy.Textbox").with_parent(parent_id);
        repo.create(scope, &mut dt).await.unwrap();
        dt
    }

    #[tokio::test]
    async fn test_move_evicts_subtree_and_publishes() {
        let repo = repo();
        let scope = scope();
        let a = create(&repo, &scope, "A", ROOT_ID).await;
        let mut b = create(&repo, &scope, "B", a.node.id).await;
        let c = create(&repo, &scope, "C", b.node.id).await;
        let d = create(&repo, &scope, "D", ROOT_ID).await;

        // Warm the cache with the pre-move state.
        repo.get_all(&scope, &[b.node.id, c.node.id]).await.unwrap();
        let mut events_rx = repo.subscribe();

        let events = repo.move_node(&scope, &mut b, Some(&d.node)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(repo.get_cached(&scope, b.node.id).unwrap().is_none());
        assert!(repo.get_cached(&scope, c.node.id).unwrap().is_none());

        let c = repo.get(&scope, c.node.id).await.unwrap();
        assert_eq!(c.node.path, NodePath::child(&b.node.path, c.node.id));

        let first = events_rx.recv().await.unwrap();
        assert_eq!(first.entity.node.id, b.node.id);
        assert_eq!(first.previous_parent_id, a.node.id);
        let second = events_rx.recv().await.unwrap();
        assert_eq!(second.entity.node.id, c.node.id);
    }

    #[tokio::test]
    async fn test_rejected_move_keeps_cache() {
        let repo = repo();
        let scope = scope();
        let mut a = create(&repo, &scope, "A", ROOT_ID).await;
        let b = create(&repo, &scope, "B", a.node.id).await;
        repo.get(&scope, a.node.id).await.unwrap();

        let err = repo.move_node(&scope, &mut a, Some(&b.node)).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(repo.get_cached(&scope, a.node.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_move_clears_tier() {
        let repo = repo();
        let scope = scope();
        let a = create(&repo, &scope, "A", ROOT_ID).await;
        let mut b = create(&repo, &scope, "B", a.node.id).await;
        create(&repo, &scope, "C", b.node.id).await;
        let d = create(&repo, &scope, "D", ROOT_ID).await;
        repo.get(&scope, a.node.id).await.unwrap();

        repo.repository().store().fail_writes_after(1);
        assert!(repo.move_node(&scope, &mut b, Some(&d.node)).await.is_err());
        assert_eq!(repo.stats(&scope).unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_update_reparent_evicts_descendants() {
        let repo = repo();
        let scope = scope();
        let a = create(&repo, &scope, "A", ROOT_ID).await;
        let mut b = create(&repo, &scope, "B", a.node.id).await;
        let c = create(&repo, &scope, "C", b.node.id).await;
        repo.get(&scope, c.node.id).await.unwrap();

        b.node.parent_id = ROOT_ID;
        repo.update(&scope, &mut b).await.unwrap();
        assert!(repo.get_cached(&scope, c.node.id).unwrap().is_none());
        assert_eq!(repo.get(&scope, c.node.id).await.unwrap().node.level, 1);
    }

    #[tokio::test]
    async fn test_failed_reparent_update_clears_tier() {
        let repo = repo();
        let scope = scope();
        let a = create(&repo, &scope, "A", ROOT_ID).await;
        let mut b = create(&repo, &scope, "B", a.node.id).await;
        let c = create(&repo, &scope, "C", b.node.id).await;
        let d = create(&repo, &scope, "D", ROOT_ID).await;
        repo.get(&scope, c.node.id).await.unwrap();

        repo.repository().store().fail_writes_after(1);
        b.node.parent_id = d.node.id;
        assert!(repo.update(&scope, &mut b).await.unwrap_err().is_write_failure());
        assert!(repo.get_cached(&scope, c.node.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_cache() {
        let repo = repo();
        let scope = scope();
        let mut a = create(&repo, &scope, "A", ROOT_ID).await;
        let b = create(&repo, &scope, "B", a.node.id).await;
        repo.get(&scope, b.node.id).await.unwrap();

        a.node.parent_id = b.node.id;
        assert!(repo.update(&scope, &mut a).await.unwrap_err().is_conflict());
        assert!(repo.get_cached(&scope, b.node.id).unwrap().is_some());
    }

    type Folders = CachedTreeRepository<EntityContainer, InMemoryNodeStore<EntityContainer>>;

    /// Data type repository plus folder repositories of two kinds over one
    /// node table and one global cache.
    fn shared_tree() -> (Repo, Folders, Folders) {
        let data_types = Arc::new(InMemoryNodeStore::<DataType>::new());
        let containers = Arc::new(data_types.sharing::<EntityContainer>());
        let config = CanopyConfig::default();
        let selector = ScopeCacheSelector::from_config(&config.cache);
        let repo = CachedTreeRepository::new(
            data_types,
            EntityKind::DataType,
            config.clone(),
            selector.clone(),
        );
        let dt_folders = CachedTreeRepository::new(
            Arc::clone(&containers),
            EntityKind::DataTypeContainer,
            config.clone(),
            selector.clone(),
        );
        let doc_folders = CachedTreeRepository::new(
            containers,
            EntityKind::DocumentTypeContainer,
            config,
            selector,
        );
        (repo, dt_folders, doc_folders)
    }

    #[tokio::test]
    async fn test_folder_kinds_do_not_share_cache() {
        let (_, dt_folders, doc_folders) = shared_tree();
        let scope = scope();
        let mut folder = EntityContainer::new(EntityKind::DataTypeContainer, "Text", ROOT_ID);
        dt_folders.create(&scope, &mut folder).await.unwrap();
        let id = folder.node.id;

        dt_folders.get(&scope, id).await.unwrap();
        assert!(doc_folders.get(&scope, id).await.unwrap_err().is_not_found());
        assert!(doc_folders.get_cached(&scope, id).unwrap().is_none());

        assert_eq!(doc_folders.clear_all(&scope).unwrap(), 0);
        assert!(dt_folders.get_cached(&scope, id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_moving_folder_evicts_contents() {
        let (repo, dt_folders, _) = shared_tree();
        let scope = scope();
        let mut a = EntityContainer::new(EntityKind::DataTypeContainer, "A", ROOT_ID);
        dt_folders.create(&scope, &mut a).await.unwrap();
        let mut b = EntityContainer::new(EntityKind::DataTypeContainer, "B", ROOT_ID);
        dt_folders.create(&scope, &mut b).await.unwrap();
        let x = create(&repo, &scope, "X", a.node.id).await;
        repo.get(&scope, x.node.id).await.unwrap();

        let events = dt_folders.move_node(&scope, &mut a, Some(&b.node)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(repo.get_cached(&scope, x.node.id).unwrap().is_none());

        let x = repo.get(&scope, x.node.id).await.unwrap();
        assert_eq!(x.node.path, NodePath::child(&a.node.path, x.node.id));
        assert_eq!(x.node.level, 2);
    }
}
