//! Canopy Storage - Tree Repository, Store Trait and Repository Cache
//!
//! Defines the store abstraction the tree repository writes through, an
//! in-memory store for tests and embedding, and the scoped cache layer that
//! sits in front of every repository.

pub mod cache;
pub mod repository;
pub mod tree;

pub use cache::{
    ActiveTier, CacheKey, CachePolicy, CacheRegistry, CacheStats, CacheableEntity,
    DeferredEviction, EntityFetcher, EntityPersister, InvalidationClock, MemoryCache,
    ScopeCacheSelector, ScopeContext, TierKind, UnitOfWork, Watermark,
};
pub use repository::CachedTreeRepository;
pub use tree::{SubtreeMove, TreeEntity, TreeRepository};

use async_trait::async_trait;
use canopy_core::{
    CanopyError, CanopyResult, EntityKind, Node, NodeId, StorageError, UNSET_ID,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Kind of row write requested from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteAction {
    Insert,
    Update,
    /// Logical delete. The store cascades dependent rows.
    Delete,
}

/// Row access for one entity type.
///
/// Implemented by the query layer. Stores return rows as stored; the tree
/// repository filters deleted rows and enforces tree invariants.
#[async_trait]
pub trait NodeStore<T: TreeEntity>: Send + Sync {
    /// Next unused node id. Ids are never reused.
    async fn next_id(&self) -> CanopyResult<NodeId>;

    /// Node row of any kind, deleted rows included.
    async fn fetch_node(&self, id: NodeId) -> CanopyResult<Option<Node>>;

    /// Entity row, deleted rows included.
    async fn fetch(&self, id: NodeId) -> CanopyResult<Option<T>>;

    /// Entity rows for `ids`, deleted rows included. Unknown ids are omitted.
    async fn fetch_many(&self, ids: &[NodeId]) -> CanopyResult<Vec<T>>;

    /// Every live entity of `kind`.
    async fn fetch_all(&self, kind: EntityKind) -> CanopyResult<Vec<T>>;

    /// Live nodes of `kind` directly under `parent_id`.
    async fn children(&self, kind: EntityKind, parent_id: NodeId) -> CanopyResult<Vec<Node>>;

    /// `(id, name)` of every live node of `kind`.
    async fn names(&self, kind: EntityKind) -> CanopyResult<Vec<(NodeId, String)>>;

    /// Live entities of `kind` whose path starts with `path_prefix`.
    async fn descendants(&self, kind: EntityKind, path_prefix: &str) -> CanopyResult<Vec<T>>;

    /// Live nodes of every kind whose path starts with `path_prefix`.
    async fn descendant_nodes(&self, path_prefix: &str) -> CanopyResult<Vec<Node>>;

    async fn write(&self, entity: &T, action: WriteAction) -> CanopyResult<()>;

    /// Rewrite the placement of an existing node row of any kind. Used for
    /// descendants of another entity type relocated by a move.
    async fn write_node(&self, node: &Node) -> CanopyResult<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Node rows and the id sequence, shared by every in-memory store of one
/// tree so that containers and the entities inside them resolve each other.
#[derive(Debug)]
pub struct NodeTable {
    nodes: RwLock<BTreeMap<NodeId, Node>>,
    next_id: AtomicI32,
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            next_id: AtomicI32::new(UNSET_ID),
        }
    }

    /// Number of node rows, deleted ones included.
    pub fn len(&self) -> usize {
        self.nodes.read().map(|nodes| nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every node row, ordered by id.
    pub fn snapshot(&self) -> CanopyResult<Vec<Node>> {
        let nodes = self.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(nodes.values().cloned().collect())
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory store for tests and embedding.
///
/// Entity rows are read back with the node row of the shared table, so a
/// placement written through another store (or `write_node`) is visible.
pub struct InMemoryNodeStore<T> {
    table: Arc<NodeTable>,
    rows: RwLock<BTreeMap<NodeId, T>>,
    write_calls: AtomicUsize,
    /// Remaining successful writes before every write fails.
    writes_before_failure: RwLock<Option<usize>>,
}

impl<T: TreeEntity> InMemoryNodeStore<T> {
    pub fn new() -> Self {
        Self::with_table(Arc::new(NodeTable::new()))
    }

    /// Store sharing its node table with other stores.
    pub fn with_table(table: Arc<NodeTable>) -> Self {
        Self {
            table,
            rows: RwLock::new(BTreeMap::new()),
            write_calls: AtomicUsize::new(0),
            writes_before_failure: RwLock::new(None),
        }
    }

    /// New store for another entity type over the same node table.
    pub fn sharing<U: TreeEntity>(&self) -> InMemoryNodeStore<U> {
        InMemoryNodeStore::with_table(Arc::clone(&self.table))
    }

    pub fn table(&self) -> &Arc<NodeTable> {
        &self.table
    }

    /// Number of write calls, failed ones included.
    pub fn write_count(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Let `n` more writes succeed, then fail every write.
    pub fn fail_writes_after(&self, n: usize) {
        if let Ok(mut remaining) = self.writes_before_failure.write() {
            *remaining = Some(n);
        }
    }

    /// Copy of every stored entity, deleted ones included.
    pub fn snapshot(&self) -> CanopyResult<Vec<T>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(rows.values().map(|row| Self::current(row, &nodes)).collect())
    }

    /// `row` with the node as currently stored in the table.
    fn current(row: &T, nodes: &BTreeMap<NodeId, Node>) -> T {
        let mut row = row.clone();
        if let Some(node) = nodes.get(&row.node().id) {
            *row.node_mut() = node.clone();
        }
        row
    }

    fn live_rows<'a>(
        rows: &'a BTreeMap<NodeId, T>,
        nodes: &'a BTreeMap<NodeId, Node>,
        kind: EntityKind,
    ) -> impl Iterator<Item = T> + 'a {
        rows.values()
            .map(move |row| Self::current(row, nodes))
            .filter(move |row| row.node().kind == kind && row.node().is_live())
    }

    fn take_write(&self, node: &Node) -> CanopyResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut remaining = self
            .writes_before_failure
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        match remaining.as_mut() {
            Some(0) => Err(CanopyError::Storage(StorageError::WriteFailed {
                kind: node.kind,
                id: node.id,
                reason: "injected write failure".to_string(),
            })),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl<T: TreeEntity> Default for InMemoryNodeStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for InMemoryNodeStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNodeStore")
            .field("nodes", &self.table.len())
            .field("write_calls", &self.write_calls.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl<T: TreeEntity> NodeStore<T> for InMemoryNodeStore<T> {
    async fn next_id(&self) -> CanopyResult<NodeId> {
        Ok(self.table.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn fetch_node(&self, id: NodeId) -> CanopyResult<Option<Node>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(nodes.get(&id).cloned())
    }

    async fn fetch(&self, id: NodeId) -> CanopyResult<Option<T>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(rows.get(&id).map(|row| Self::current(row, &nodes)))
    }

    async fn fetch_many(&self, ids: &[NodeId]) -> CanopyResult<Vec<T>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id))
            .map(|row| Self::current(row, &nodes))
            .collect())
    }

    async fn fetch_all(&self, kind: EntityKind) -> CanopyResult<Vec<T>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(Self::live_rows(&rows, &nodes, kind).collect())
    }

    async fn children(&self, kind: EntityKind, parent_id: NodeId) -> CanopyResult<Vec<Node>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(nodes
            .values()
            .filter(|n| n.kind == kind && n.parent_id == parent_id && n.is_live())
            .cloned()
            .collect())
    }

    async fn names(&self, kind: EntityKind) -> CanopyResult<Vec<(NodeId, String)>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(nodes
            .values()
            .filter(|n| n.kind == kind && n.is_live())
            .map(|n| (n.id, n.name.clone()))
            .collect())
    }

    async fn descendants(&self, kind: EntityKind, path_prefix: &str) -> CanopyResult<Vec<T>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(Self::live_rows(&rows, &nodes, kind)
            .filter(|row| row.node().path.as_str().starts_with(path_prefix))
            .collect())
    }

    async fn descendant_nodes(&self, path_prefix: &str) -> CanopyResult<Vec<Node>> {
        let nodes = self.table.nodes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(nodes
            .values()
            .filter(|n| n.is_live() && n.path.as_str().starts_with(path_prefix))
            .cloned()
            .collect())
    }

    async fn write(&self, entity: &T, action: WriteAction) -> CanopyResult<()> {
        let node = entity.node();
        self.take_write(node)?;

        let mut nodes = self.table.nodes.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut rows = self.rows.write().map_err(|_| StorageError::LockPoisoned)?;

        let exists = nodes.contains_key(&node.id);
        let reason = match action {
            WriteAction::Insert if exists => Some("row already exists"),
            WriteAction::Update | WriteAction::Delete if !exists => Some("row does not exist"),
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(CanopyError::Storage(StorageError::WriteFailed {
                kind: node.kind,
                id: node.id,
                reason: reason.to_string(),
            }));
        }

        nodes.insert(node.id, node.clone());
        rows.insert(node.id, entity.clone());
        Ok(())
    }

    async fn write_node(&self, node: &Node) -> CanopyResult<()> {
        self.take_write(node)?;
        let mut nodes = self.table.nodes.write().map_err(|_| StorageError::LockPoisoned)?;
        match nodes.get_mut(&node.id) {
            Some(stored) => {
                *stored = node.clone();
                Ok(())
            }
            None => Err(CanopyError::Storage(StorageError::WriteFailed {
                kind: node.kind,
                id: node.id,
                reason: "row does not exist".to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{DataType, EntityContainer, NodePath, ROOT_ID};

    fn placed(mut dt: DataType, id: NodeId) -> DataType {
        dt.node.id = id;
        dt.node.path = NodePath::root(id);
        dt
    }

    #[tokio::test]
    async fn test_ids_are_shared_across_stores() {
        let data_types = InMemoryNodeStore::<DataType>::new();
        let containers: InMemoryNodeStore<EntityContainer> = data_types.sharing();

        assert_eq!(data_types.next_id().await.unwrap(), 1);
        assert_eq!(containers.next_id().await.unwrap(), 2);
        assert_eq!(data_types.next_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_write_and_fetch() {
        let store = InMemoryNodeStore::<DataType>::new();
        let dt = placed(DataType::new("Label", "Canopy.Label"), 1);
        store.write(&dt, WriteAction::Insert).await.unwrap();

        assert_eq!(store.fetch(1).await.unwrap(), Some(dt.clone()));
        assert_eq!(store.fetch_node(1).await.unwrap().map(|n| n.id), Some(1));
        assert_eq!(store.children(EntityKind::DataType, ROOT_ID).await.unwrap().len(), 1);
        assert_eq!(
            store.names(EntityKind::DataType).await.unwrap(),
            vec![(1, "Label".to_string())]
        );

        let err = store.write(&dt, WriteAction::Insert).await.unwrap_err();
        assert!(matches!(err, CanopyError::Storage(StorageError::WriteFailed { .. })));
    }

    #[tokio::test]
    async fn test_deleted_rows_are_not_live() {
        let store = InMemoryNodeStore::<DataType>::new();
        let mut dt = placed(DataType::new("Label", "Canopy.Label"), 1);
        store.write(&dt, WriteAction::Insert).await.unwrap();

        dt.node.deleted_at = Some(chrono::Utc::now());
        store.write(&dt, WriteAction::Delete).await.unwrap();

        assert!(store.fetch_all(EntityKind::DataType).await.unwrap().is_empty());
        assert!(store.names(EntityKind::DataType).await.unwrap().is_empty());
        // Still resolvable for historical references.
        assert!(store.fetch_node(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryNodeStore::<DataType>::new();
        store.fail_writes_after(1);
        store
            .write(&placed(DataType::new("A", "x"), 1), WriteAction::Insert)
            .await
            .unwrap();
        let err = store
            .write(&placed(DataType::new("B", "x"), 2), WriteAction::Insert)
            .await
            .unwrap_err();
        assert!(matches!(err, CanopyError::Storage(StorageError::WriteFailed { id: 2, .. })));
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.table().len(), 1);
    }

    #[tokio::test]
    async fn test_node_writes_show_through_other_stores() {
        let data_types = InMemoryNodeStore::<DataType>::new();
        let containers: InMemoryNodeStore<EntityContainer> = data_types.sharing();

        let mut folder = EntityContainer::new(EntityKind::DataTypeContainer, "F", ROOT_ID);
        folder.node.id = 1;
        folder.node.path = NodePath::root(1);
        containers.write(&folder, WriteAction::Insert).await.unwrap();
        let mut dt = DataType::new("Label", "Canopy.Label").with_parent(1);
        dt.node.id = 2;
        dt.node.path = NodePath::child(&folder.node.path, 2);
        dt.node.level = 1;
        data_types.write(&dt, WriteAction::Insert).await.unwrap();

        let under = containers.descendant_nodes(&folder.node.path.descendant_prefix()).await.unwrap();
        assert_eq!(under.iter().map(|n| n.id).collect::<Vec<_>>(), vec![2]);

        let mut moved = under[0].clone();
        moved.path = "-1,9,1,2".parse().unwrap();
        moved.level = 2;
        containers.write_node(&moved).await.unwrap();

        let reread = data_types.fetch(2).await.unwrap().unwrap();
        assert_eq!(reread.node.path, moved.path);
        assert_eq!(reread.node.level, 2);
        assert_eq!(reread.editor_alias, "Canopy.Label");

        let mut ghost = moved.clone();
        ghost.id = 404;
        assert!(containers.write_node(&ghost).await.is_err());
    }
}
