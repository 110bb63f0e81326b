//! Canopy Test Utilities
//!
//! Centralized test infrastructure for the Canopy workspace:
//! - Proptest generators for entities, configuration and tree operations
//! - A counting store wrapper for asserting repository round trips
//! - Test fixtures for common scenarios
//! - Custom assertions for tree and error validation

pub use canopy_storage::{
    CachePolicy, CachedTreeRepository, InMemoryNodeStore, NodeStore, NodeTable,
    ScopeCacheSelector, ScopeContext, TreeEntity, TreeRepository, UnitOfWork, WriteAction,
};

pub use canopy_core::{
    CacheConfig, CacheMode, CanopyConfig, CanopyError, CanopyResult, ConfigError, DataType,
    EntityContainer, EntityKind, MoveEvent, NameConflictPolicy, Node, NodeId, NodePath,
    StorageError, TreeError, ValueStorageType, ROOT_ID,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG` (default `warn`) once per
/// test binary. Output goes through the test harness capture.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// COUNTING STORE
// ============================================================================

/// Store wrapper counting every read and write that reaches the store.
#[derive(Debug)]
pub struct CountingStore<S> {
    inner: Arc<S>,
    fetches: AtomicUsize,
    writes: AtomicUsize,
}

impl<S> CountingStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Entity fetches (`fetch`, `fetch_many`, `fetch_all`, `descendants`).
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Entity and node writes (`write`, `write_node`).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.fetches.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }

    fn count_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<T, S> NodeStore<T> for CountingStore<S>
where
    T: TreeEntity,
    S: NodeStore<T>,
{
    async fn next_id(&self) -> CanopyResult<NodeId> {
        self.inner.next_id().await
    }

    async fn fetch_node(&self, id: NodeId) -> CanopyResult<Option<Node>> {
        self.inner.fetch_node(id).await
    }

    async fn fetch(&self, id: NodeId) -> CanopyResult<Option<T>> {
        self.count_fetch();
        self.inner.fetch(id).await
    }

    async fn fetch_many(&self, ids: &[NodeId]) -> CanopyResult<Vec<T>> {
        self.count_fetch();
        self.inner.fetch_many(ids).await
    }

    async fn fetch_all(&self, kind: EntityKind) -> CanopyResult<Vec<T>> {
        self.count_fetch();
        self.inner.fetch_all(kind).await
    }

    async fn children(&self, kind: EntityKind, parent_id: NodeId) -> CanopyResult<Vec<Node>> {
        self.inner.children(kind, parent_id).await
    }

    async fn names(&self, kind: EntityKind) -> CanopyResult<Vec<(NodeId, String)>> {
        self.inner.names(kind).await
    }

    async fn descendants(&self, kind: EntityKind, path_prefix: &str) -> CanopyResult<Vec<T>> {
        self.count_fetch();
        self.inner.descendants(kind, path_prefix).await
    }

    async fn descendant_nodes(&self, path_prefix: &str) -> CanopyResult<Vec<Node>> {
        self.inner.descendant_nodes(path_prefix).await
    }

    async fn write(&self, entity: &T, action: WriteAction) -> CanopyResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(entity, action).await
    }

    async fn write_node(&self, node: &Node) -> CanopyResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_node(node).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Canopy types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a CacheMode variant.
    pub fn arb_cache_mode() -> impl Strategy<Value = CacheMode> {
        prop_oneof![
            Just(CacheMode::Default),
            Just(CacheMode::Scoped),
            Just(CacheMode::None),
        ]
    }

    pub fn arb_value_storage() -> impl Strategy<Value = ValueStorageType> {
        prop_oneof![
            Just(ValueStorageType::Integer),
            Just(ValueStorageType::Decimal),
            Just(ValueStorageType::Date),
            Just(ValueStorageType::Nvarchar),
            Just(ValueStorageType::Ntext),
        ]
    }

    /// Display names, including ones differing only by case.
    pub fn arb_node_name() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9 ]{0,15}"
    }

    /// Unsaved root-level data type.
    pub fn arb_data_type() -> impl Strategy<Value = DataType> {
        (arb_node_name(), "[A-Z][a-z]{2,8}\\.[A-Z][a-z]{2,8}", arb_value_storage()).prop_map(
            |(name, alias, storage)| DataType::new(name, alias).with_value_storage(storage),
        )
    }

    /// Generate a CanopyConfig that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = CanopyConfig> {
        (
            0i32..4,
            prop_oneof![Just(NameConflictPolicy::Reject), Just(NameConflictPolicy::Suffix)],
            1usize..50_000,
            arb_cache_mode(),
        )
            .prop_map(|(root_level, name_conflict, max_entries, mode)| {
                CanopyConfig::default()
                    .with_root_level(root_level)
                    .with_name_conflict(name_conflict)
                    .with_cache(
                        CacheConfig::default()
                            .with_max_entries(max_entries)
                            .with_default_mode(mode),
                    )
            })
    }

    /// One step of a random tree workload. Indexes are reduced modulo the
    /// number of nodes created so far.
    #[derive(Debug, Clone)]
    pub enum TreeOp {
        Create { parent: Option<usize> },
        Move { node: usize, parent: Option<usize> },
        Delete { node: usize },
    }

    pub fn arb_tree_op() -> impl Strategy<Value = TreeOp> {
        prop_oneof![
            4 => prop::option::of(0usize..64).prop_map(|parent| TreeOp::Create { parent }),
            3 => (0usize..64, prop::option::of(0usize..64))
                .prop_map(|(node, parent)| TreeOp::Move { node, parent }),
            1 => (0usize..64).prop_map(|node| TreeOp::Delete { node }),
        ]
    }

    pub fn arb_tree_ops(max_len: usize) -> impl Strategy<Value = Vec<TreeOp>> {
        prop::collection::vec(arb_tree_op(), 1..max_len.max(2))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    pub type DataTypeStore = CountingStore<InMemoryNodeStore<DataType>>;
    pub type DataTypeRepository = CachedTreeRepository<DataType, DataTypeStore>;

    /// Create a minimal valid CanopyConfig for testing.
    pub fn minimal_config() -> CanopyConfig {
        CanopyConfig::default().with_cache(CacheConfig::default().with_max_entries(1_000))
    }

    pub fn unit_of_work(mode: CacheMode) -> UnitOfWork {
        UnitOfWork::new(mode, &minimal_config().cache)
    }

    /// Cached data type repository over a fresh in-memory store, with the
    /// store wrapped for round-trip counting.
    pub fn data_type_repository() -> (DataTypeRepository, Arc<DataTypeStore>) {
        let config = minimal_config();
        let store = Arc::new(CountingStore::new(Arc::new(InMemoryNodeStore::new())));
        let selector = ScopeCacheSelector::from_config(&config.cache);
        let repo = CachedTreeRepository::new(
            Arc::clone(&store),
            EntityKind::DataType,
            config,
            selector,
        );
        (repo, store)
    }

    /// Unsaved data type under `parent_id`.
    pub fn text_data_type(name: &str, parent_id: NodeId) -> DataType {
        DataType::new(name, "Canopy.Textbox")
            .with_parent(parent_id)
            .with_value_storage(ValueStorageType::Nvarchar)
            .with_configuration(serde_json::json!({ "maxChars": 255 }))
    }

    pub fn folder(name: &str, parent_id: NodeId) -> EntityContainer {
        EntityContainer::new(EntityKind::DataTypeContainer, name, parent_id)
    }

    pub type FolderRepository =
        CachedTreeRepository<EntityContainer, InMemoryNodeStore<EntityContainer>>;

    /// Cached data type, data type folder and document type folder
    /// repositories over one node table and one global cache.
    pub struct FolderTree {
        pub data_types: DataTypeRepository,
        pub store: Arc<DataTypeStore>,
        pub folders: FolderRepository,
        pub document_folders: FolderRepository,
    }

    impl FolderTree {
        /// Every node row, all kinds.
        pub fn nodes(&self) -> Vec<Node> {
            self.store.inner().table().snapshot().unwrap_or_default()
        }
    }

    pub fn folder_tree() -> FolderTree {
        let config = minimal_config();
        let selector = ScopeCacheSelector::from_config(&config.cache);
        let store = Arc::new(CountingStore::new(Arc::new(
            InMemoryNodeStore::<DataType>::new(),
        )));
        let containers = Arc::new(store.inner().sharing::<EntityContainer>());

        let data_types = CachedTreeRepository::new(
            Arc::clone(&store),
            EntityKind::DataType,
            config.clone(),
            selector.clone(),
        );
        let folders = CachedTreeRepository::new(
            Arc::clone(&containers),
            EntityKind::DataTypeContainer,
            config.clone(),
            selector.clone(),
        );
        let document_folders = CachedTreeRepository::new(
            containers,
            EntityKind::DocumentTypeContainer,
            config,
            selector,
        );
        FolderTree {
            data_types,
            store,
            folders,
            document_folders,
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Canopy-specific validation.

    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Assert that a CanopyResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CanopyResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a CanopyResult is a NotFound storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CanopyResult<T>, kind: EntityKind) {
        match result {
            Err(CanopyError::Storage(StorageError::NotFound { kind: k, .. })) => {
                assert_eq!(*k, kind, "Wrong entity kind in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", kind, other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_move<T: std::fmt::Debug>(result: &CanopyResult<T>) {
        match result {
            Err(CanopyError::Tree(TreeError::InvalidMove { .. })) => {}
            other => panic!("Expected InvalidMove error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_fatal<T: std::fmt::Debug>(result: &CanopyResult<T>) {
        match result {
            Err(err) if err.is_fatal() => {}
            other => panic!("Expected fatal error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_valid(config: &CanopyConfig) {
        if let Err(err) = config.validate() {
            panic!("Expected valid config, got: {}", err);
        }
    }

    /// Assert the path, level and sibling invariants over every live node.
    ///
    /// `nodes` may mix kinds; parents are looked up across all of them.
    #[track_caller]
    pub fn assert_tree_invariants(nodes: &[Node], root_level: i32) {
        let live: HashMap<NodeId, &Node> = nodes
            .iter()
            .filter(|n| n.is_live())
            .map(|n| (n.id, n))
            .collect();
        let mut sort_orders: HashSet<(EntityKind, NodeId, i32)> = HashSet::new();

        for node in live.values() {
            if node.parent_id == ROOT_ID {
                assert_eq!(node.path, NodePath::root(node.id), "root path of {}", node.id);
                assert_eq!(node.level, root_level, "root level of {}", node.id);
            } else {
                let parent = live
                    .get(&node.parent_id)
                    .unwrap_or_else(|| panic!("node {} has no live parent {}", node.id, node.parent_id));
                assert_eq!(
                    node.path,
                    NodePath::child(&parent.path, node.id),
                    "path of {}",
                    node.id
                );
                assert_eq!(node.level, parent.level + 1, "level of {}", node.id);
            }

            for ancestor in node.path.ids().into_iter().skip(1) {
                assert!(
                    live.contains_key(&ancestor),
                    "node {} has dangling ancestor {}",
                    node.id,
                    ancestor
                );
            }

            assert!(
                sort_orders.insert((node.kind, node.parent_id, node.sort_order)),
                "duplicate sort order {} under {}",
                node.sort_order,
                node.parent_id
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
