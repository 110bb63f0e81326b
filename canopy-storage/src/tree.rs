//! Materialized-path tree repository.
//!
//! Maintains `path`, `level` and `sort_order` of every node of one entity
//! kind across create, update, move and delete. Every check (existence,
//! parent, name, cycle) runs before the first write of an operation.
//!
//! Kinds share one node table: a data type can sit in a data type folder.
//! Moving a node relocates its live descendants of every kind.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use canopy_core::{
    has_identity, names_equal, CanopyConfig, CanopyError, CanopyResult, DataType,
    EntityContainer, EntityKind, MoveEvent, NameConflictPolicy, Node, NodeId, NodePath,
    StorageError, TreeError, ROOT_ID,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::{CacheableEntity, EntityFetcher, EntityPersister};
use crate::{NodeStore, WriteAction};

/// An entity stored as a tree node.
pub trait TreeEntity: CacheableEntity<NodeId> {
    fn node(&self) -> &Node;

    fn node_mut(&mut self) -> &mut Node;
}

impl TreeEntity for DataType {
    fn node(&self) -> &Node {
        &self.node
    }

    fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }
}

impl TreeEntity for EntityContainer {
    fn node(&self) -> &Node {
        &self.node
    }

    fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }
}

/// Outcome of moving a subtree.
#[derive(Debug, Clone)]
pub struct SubtreeMove<T> {
    /// The moved entity first, then descendants of the same kind by
    /// ascending level.
    pub events: Vec<MoveEvent<T>>,
    /// Relocated descendants of other kinds, post-move.
    pub other_nodes: Vec<Node>,
}

impl<T: TreeEntity> SubtreeMove<T> {
    /// Id of every relocated node, whatever its kind.
    pub fn affected_ids(&self) -> Vec<NodeId> {
        self.events
            .iter()
            .map(|e| e.entity.node().id)
            .chain(self.other_nodes.iter().map(|n| n.id))
            .collect()
    }
}

/// Descendants relocated below a moved node, not yet written.
struct Relocated<T> {
    events: Vec<MoveEvent<T>>,
    other_nodes: Vec<Node>,
}

impl<T: TreeEntity> Relocated<T> {
    fn len(&self) -> usize {
        self.events.len() + self.other_nodes.len()
    }
}

/// Tree repository for one entity kind.
pub struct TreeRepository<T, S> {
    store: Arc<S>,
    kind: EntityKind,
    config: CanopyConfig,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S> TreeRepository<T, S>
where
    T: TreeEntity,
    S: NodeStore<T>,
{
    pub fn new(store: Arc<S>, kind: EntityKind, config: CanopyConfig) -> Self {
        Self {
            store,
            kind,
            config,
            _entity: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn config(&self) -> &CanopyConfig {
        &self.config
    }

    fn not_found(&self, id: NodeId) -> CanopyError {
        CanopyError::Storage(StorageError::NotFound {
            kind: self.kind,
            id: id.to_string(),
        })
    }

    fn belongs(&self, entity: &T) -> bool {
        let node = entity.node();
        node.kind == self.kind && node.is_live()
    }

    async fn fetch_live(&self, id: NodeId) -> CanopyResult<Option<T>> {
        Ok(self.store.fetch(id).await?.filter(|e| self.belongs(e)))
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Live entity `id`.
    pub async fn get(&self, id: NodeId) -> CanopyResult<T> {
        self.fetch_live(id).await?.ok_or_else(|| self.not_found(id))
    }

    /// Live entities for `ids` in no particular order; unknown and deleted
    /// ids are omitted. An empty slice returns every live entity.
    pub async fn get_all(&self, ids: &[NodeId]) -> CanopyResult<Vec<T>> {
        if ids.is_empty() {
            return self.store.fetch_all(self.kind).await;
        }
        let mut seen = HashSet::with_capacity(ids.len());
        let unique: Vec<NodeId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let rows = self.store.fetch_many(&unique).await?;
        Ok(rows.into_iter().filter(|e| self.belongs(e)).collect())
    }

    pub async fn exists(&self, id: NodeId) -> CanopyResult<bool> {
        Ok(self.fetch_live(id).await?.is_some())
    }

    // ========================================================================
    // VALIDATION
    // ========================================================================

    /// Live parent node, `None` for the root sentinel.
    async fn resolve_parent(&self, parent_id: NodeId) -> CanopyResult<Option<Node>> {
        if parent_id == ROOT_ID {
            return Ok(None);
        }
        match self.store.fetch_node(parent_id).await? {
            Some(parent) if parent.is_live() && parent.path.is_assigned() => Ok(Some(parent)),
            _ => Err(TreeError::ParentNotFound {
                kind: self.kind,
                parent_id,
            }
            .into()),
        }
    }

    /// Enforce case-insensitive name uniqueness among live nodes of the kind,
    /// ignoring `exclude`. Under the suffix policy a taken name is rewritten
    /// to the first free `"{name} ({n})"`.
    async fn resolve_name(&self, entity: &mut T, exclude: Option<NodeId>) -> CanopyResult<()> {
        let names = self.store.names(self.kind).await?;
        let taken = |candidate: &str| {
            names
                .iter()
                .any(|(id, name)| Some(*id) != exclude && names_equal(name, candidate))
        };

        let name = entity.node().name.clone();
        if !taken(&name) {
            return Ok(());
        }

        match self.config.name_conflict {
            NameConflictPolicy::Reject => Err(TreeError::DuplicateName {
                kind: self.kind,
                name,
            }
            .into()),
            NameConflictPolicy::Suffix => {
                let unique = (1..)
                    .map(|n| format!("{} ({})", name, n))
                    .find(|candidate| !taken(candidate))
                    .unwrap_or_else(|| name.clone());
                debug!(kind = %self.kind, from = %name, to = %unique, "renamed to avoid duplicate");
                entity.node_mut().name = unique;
                Ok(())
            }
        }
    }

    fn check_not_below(&self, node: &Node, target: Option<&Node>) -> CanopyResult<()> {
        match target {
            Some(parent) if parent.id == node.id || node.is_ancestor_of(parent) => {
                Err(TreeError::InvalidMove {
                    id: node.id,
                    target_id: parent.id,
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    // ========================================================================
    // PLACEMENT
    // ========================================================================

    /// Put `node` under `parent` (root level for `None`).
    fn place(&self, node: &mut Node, parent: Option<&Node>) {
        node.parent_id = parent.map_or(ROOT_ID, |p| p.id);
        node.path = NodePath::under(parent.map(|p| &p.path), node.id);
        node.level = parent.map_or(self.config.root_level, |p| p.level + 1);
    }

    /// Sort order for a new node: the live sibling count, or one past the
    /// highest sibling if the count is already taken.
    async fn next_create_sort_order(&self, parent_id: NodeId) -> CanopyResult<i32> {
        let siblings = self.store.children(self.kind, parent_id).await?;
        let count = siblings.len() as i32;
        if siblings.iter().any(|s| s.sort_order == count) {
            let max = siblings.iter().map(|s| s.sort_order).max().unwrap_or(0);
            Ok(max + 1)
        } else {
            Ok(count)
        }
    }

    /// Sort order placing `id` after every other live sibling.
    async fn next_move_sort_order(&self, parent_id: NodeId, id: NodeId) -> CanopyResult<i32> {
        let siblings = self.store.children(self.kind, parent_id).await?;
        let max = siblings
            .iter()
            .filter(|s| s.id != id)
            .map(|s| s.sort_order)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Recompute path and level of every live descendant of a node that
    /// moved from `old_path`/`old_level` to `moved`, whatever their kind.
    /// Nothing is written.
    ///
    /// Descendants are processed by ascending level, so each one finds its
    /// already relocated parent.
    async fn relocate_descendants(
        &self,
        moved: &Node,
        old_path: &NodePath,
        old_level: i32,
    ) -> CanopyResult<Relocated<T>> {
        let prefix = old_path.descendant_prefix();
        let mut nodes = self.store.descendant_nodes(&prefix).await?;
        nodes.retain(|n| n.id != moved.id);
        nodes.sort_by_key(|n| (n.level, n.id));

        let mut entities: HashMap<NodeId, T> = self
            .store
            .descendants(self.kind, &prefix)
            .await?
            .into_iter()
            .map(|e| (e.node().id, e))
            .collect();

        let mut relocated: HashMap<NodeId, (NodePath, i32)> = HashMap::new();
        relocated.insert(moved.id, (moved.path.clone(), moved.level));

        let now = Utc::now();
        let mut out = Relocated {
            events: Vec::with_capacity(entities.len()),
            other_nodes: Vec::new(),
        };
        for mut node in nodes {
            let previous_path = node.path.clone();
            let previous_parent_id = node.parent_id;
            let id = node.id;

            let (path, level) = match relocated.get(&previous_parent_id) {
                Some((parent_path, parent_level)) => {
                    (NodePath::child(parent_path, id), parent_level + 1)
                }
                None => {
                    // Parent row is deleted; carry the moved prefix over.
                    warn!(
                        kind = %self.kind,
                        id,
                        parent_id = previous_parent_id,
                        "descendant parent not relocated, rewriting path prefix"
                    );
                    let suffix = &previous_path.as_str()[old_path.as_str().len()..];
                    let path: NodePath = format!("{}{}", moved.path, suffix).parse()?;
                    (path, node.level - old_level + moved.level)
                }
            };
            relocated.insert(id, (path.clone(), level));

            match entities.remove(&id) {
                Some(mut entity) => {
                    let node = entity.node_mut();
                    node.path = path;
                    node.level = level;
                    node.updated_at = now;
                    out.events
                        .push(MoveEvent::new(entity, previous_path, previous_parent_id));
                }
                None => {
                    node.path = path;
                    node.level = level;
                    node.updated_at = now;
                    out.other_nodes.push(node);
                }
            }
        }
        Ok(out)
    }

    /// Write relocated descendants, one write per node.
    async fn write_relocated(&self, relocated: &Relocated<T>) -> CanopyResult<()> {
        for event in &relocated.events {
            self.store.write(&event.entity, WriteAction::Update).await?;
        }
        for node in &relocated.other_nodes {
            self.store.write_node(node).await?;
        }
        Ok(())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert a new entity. Assigns id (if unset), path, level and sort
    /// order. Returns the affected ids.
    pub async fn create(&self, entity: &mut T) -> CanopyResult<Vec<NodeId>> {
        if entity.node().kind != self.kind {
            return Err(StorageError::WriteFailed {
                kind: self.kind,
                id: entity.node().id,
                reason: format!("{} does not belong to this repository", entity.node().kind),
            }
            .into());
        }

        self.resolve_name(entity, None).await?;
        let parent = self.resolve_parent(entity.node().parent_id).await?;

        if !has_identity(entity.node().id) {
            entity.node_mut().id = self.store.next_id().await?;
        }
        let parent_id = parent.as_ref().map_or(ROOT_ID, |p| p.id);
        let sort_order = self.next_create_sort_order(parent_id).await?;

        let now = Utc::now();
        let node = entity.node_mut();
        self.place(node, parent.as_ref());
        node.sort_order = sort_order;
        node.created_at = now;
        node.updated_at = now;
        node.deleted_at = None;

        self.store.write(entity, WriteAction::Insert).await?;
        let node = entity.node();
        debug!(kind = %self.kind, id = node.id, path = %node.path, "created node");
        Ok(vec![node.id])
    }

    /// Persist changes to a live entity.
    ///
    /// A parent change is detected against the stored row and relocates the
    /// entity (to the end of its new sibling list) together with its
    /// descendants. Returns the ids of the entity and every relocated
    /// descendant.
    pub async fn update(&self, entity: &mut T) -> CanopyResult<Vec<NodeId>> {
        let id = entity.node().id;
        let stored = self.get(id).await?;
        let stored = stored.node();

        self.resolve_name(entity, Some(id)).await?;

        let parent_changed = entity.node().parent_id != stored.parent_id;
        let parent = if parent_changed {
            let parent = self.resolve_parent(entity.node().parent_id).await?;
            self.check_not_below(stored, parent.as_ref())?;
            Some(parent)
        } else {
            None
        };

        let node = entity.node_mut();
        node.key = stored.key;
        node.kind = stored.kind;
        node.created_at = stored.created_at;
        node.deleted_at = None;
        node.updated_at = Utc::now();

        let descendants = match parent {
            Some(parent) => {
                let parent_id = parent.as_ref().map_or(ROOT_ID, |p| p.id);
                let sort_order = self.next_move_sort_order(parent_id, id).await?;
                let node = entity.node_mut();
                self.place(node, parent.as_ref());
                node.sort_order = sort_order;
                self.relocate_descendants(entity.node(), &stored.path, stored.level)
                    .await?
            }
            None => {
                let node = entity.node_mut();
                node.parent_id = stored.parent_id;
                node.path = stored.path.clone();
                node.level = stored.level;
                Relocated {
                    events: Vec::new(),
                    other_nodes: Vec::new(),
                }
            }
        };

        self.store.write(entity, WriteAction::Update).await?;
        self.write_relocated(&descendants).await?;

        debug!(kind = %self.kind, id, relocated = descendants.len(), "updated node");
        let mut affected = Vec::with_capacity(descendants.len() + 1);
        affected.push(id);
        affected.extend(descendants.events.iter().map(|e| e.entity.node().id));
        affected.extend(descendants.other_nodes.iter().map(|n| n.id));
        Ok(affected)
    }

    /// Move an entity (with its subtree) under `new_parent`, or to root
    /// level for `None`.
    ///
    /// The parent is re-resolved through the store and the move is rejected
    /// before any write if it would place the entity under itself. Returns
    /// one event per relocated entity of this kind: the moved one first,
    /// then its descendants by ascending level.
    pub async fn move_node(
        &self,
        entity: &mut T,
        new_parent: Option<&Node>,
    ) -> CanopyResult<Vec<MoveEvent<T>>> {
        Ok(self.move_subtree(entity, new_parent).await?.events)
    }

    /// [`move_node`](Self::move_node), also reporting relocated descendants
    /// of other kinds.
    pub async fn move_subtree(
        &self,
        entity: &mut T,
        new_parent: Option<&Node>,
    ) -> CanopyResult<SubtreeMove<T>> {
        let id = entity.node().id;
        let stored = self.get(id).await?;
        let stored = stored.node();

        let parent = match new_parent {
            Some(target) => self.resolve_parent(target.id).await?,
            None => None,
        };
        self.check_not_below(stored, parent.as_ref())?;

        let parent_id = parent.as_ref().map_or(ROOT_ID, |p| p.id);
        let sort_order = self.next_move_sort_order(parent_id, id).await?;

        let node = entity.node_mut();
        node.key = stored.key;
        node.created_at = stored.created_at;
        self.place(node, parent.as_ref());
        node.sort_order = sort_order;
        node.updated_at = Utc::now();

        let mut events = vec![MoveEvent::new(
            entity.clone(),
            stored.path.clone(),
            stored.parent_id,
        )];
        let descendants = self
            .relocate_descendants(entity.node(), &stored.path, stored.level)
            .await?;

        self.store.write(entity, WriteAction::Update).await?;
        self.write_relocated(&descendants).await?;

        info!(
            kind = %self.kind,
            id,
            parent_id,
            descendants = descendants.len(),
            "moved node"
        );
        events.extend(descendants.events);
        Ok(SubtreeMove {
            events,
            other_nodes: descendants.other_nodes,
        })
    }

    /// Logically delete a live entity. Sibling sort orders are left alone.
    pub async fn delete(&self, entity: &mut T) -> CanopyResult<Vec<NodeId>> {
        let id = entity.node().id;
        self.get(id).await?;

        let now = Utc::now();
        let node = entity.node_mut();
        node.deleted_at = Some(now);
        node.updated_at = now;

        self.store.write(entity, WriteAction::Delete).await?;
        debug!(kind = %self.kind, id, "deleted node");
        Ok(vec![id])
    }
}

impl<T, S> Clone for TreeRepository<T, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            kind: self.kind,
            config: self.config.clone(),
            _entity: PhantomData,
        }
    }
}

// ============================================================================
// CACHE POLICY CALLBACKS
// ============================================================================

fn others(affected: Vec<NodeId>, id: NodeId) -> Vec<NodeId> {
    affected.into_iter().filter(|a| *a != id).collect()
}

#[async_trait]
impl<T, S> EntityFetcher<NodeId, T> for TreeRepository<T, S>
where
    T: TreeEntity,
    S: NodeStore<T>,
{
    async fn fetch_one(&self, id: NodeId) -> CanopyResult<Option<T>> {
        self.fetch_live(id).await
    }

    async fn fetch_many(&self, ids: &[NodeId]) -> CanopyResult<Vec<T>> {
        self.get_all(ids).await
    }

    async fn exists(&self, id: NodeId) -> CanopyResult<bool> {
        TreeRepository::exists(self, id).await
    }
}

#[async_trait]
impl<T, S> EntityPersister<NodeId, T> for TreeRepository<T, S>
where
    T: TreeEntity,
    S: NodeStore<T>,
{
    async fn persist_new(&self, entity: &mut T) -> CanopyResult<Vec<NodeId>> {
        let affected = self.create(entity).await?;
        Ok(others(affected, entity.node().id))
    }

    async fn persist_updated(&self, entity: &mut T) -> CanopyResult<Vec<NodeId>> {
        let affected = self.update(entity).await?;
        Ok(others(affected, entity.node().id))
    }

    async fn persist_deleted(&self, entity: &mut T) -> CanopyResult<Vec<NodeId>> {
        let affected = self.delete(entity).await?;
        Ok(others(affected, entity.node().id))
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::InMemoryNodeStore;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Create { parent: usize },
        Move { node: usize, parent: Option<usize> },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..32).prop_map(|parent| Op::Create { parent }),
            (0usize..32, prop::option::of(0usize..32))
                .prop_map(|(node, parent)| Op::Move { node, parent }),
        ]
    }

    fn assert_invariants(rows: &[DataType], root_level: i32) -> Result<(), TestCaseError> {
        let by_id: HashMap<NodeId, &DataType> = rows.iter().map(|r| (r.node.id, r)).collect();
        for row in rows {
            let node = &row.node;
            if node.parent_id == ROOT_ID {
                prop_assert_eq!(&node.path, &NodePath::root(node.id));
                prop_assert_eq!(node.level, root_level);
            } else {
                let parent = by_id.get(&node.parent_id).map(|p| &p.node);
                prop_assert!(parent.is_some(), "dangling parent {}", node.parent_id);
                let parent = parent.unwrap();
                prop_assert_eq!(&node.path, &NodePath::child(&parent.path, node.id));
                prop_assert_eq!(node.level, parent.level + 1);
            }
            for ancestor in &node.path.ids()[1..] {
                prop_assert!(by_id.contains_key(ancestor));
            }
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: any sequence of creates and moves keeps the path and
        /// level invariants, and rejected moves change nothing.
        #[test]
        fn prop_random_ops_keep_tree_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let repo = TreeRepository::new(
                    Arc::new(InMemoryNodeStore::<DataType>::new()),
                    EntityKind::DataType,
                    CanopyConfig::default().with_name_conflict(NameConflictPolicy::Suffix),
                );
                let mut ids: Vec<NodeId> = Vec::new();

                for op in ops {
                    match op {
                        Op::Create { parent } => {
                            let parent_id = if ids.is_empty() { ROOT_ID } else { ids[parent % ids.len()] };
                            let mut dt = DataType::new("n", "x").with_parent(parent_id);
                            repo.create(&mut dt).await.unwrap();
                            ids.push(dt.node.id);
                        }
                        Op::Move { node, parent } => {
                            if ids.is_empty() {
                                continue;
                            }
                            let mut entity = repo.get(ids[node % ids.len()]).await.unwrap();
                            let target = match parent {
                                Some(p) => Some(repo.get(ids[p % ids.len()]).await.unwrap().node),
                                None => None,
                            };
                            let before = repo.store().snapshot().unwrap();
                            let cyclic = target.as_ref().is_some_and(|t| {
                                t.id == entity.node.id || t.path.is_descendant_of(&entity.node.path)
                            });
                            match repo.move_node(&mut entity, target.as_ref()).await {
                                Ok(events) => prop_assert!(!cyclic && !events.is_empty()),
                                Err(err) => {
                                    prop_assert!(cyclic && err.is_conflict());
                                    prop_assert_eq!(repo.store().snapshot().unwrap(), before);
                                }
                            }
                        }
                    }
                    assert_invariants(&repo.store().snapshot().unwrap(), 0)?;
                }
                Ok(())
            })?;
        }
    }
}
