//! Canopy Core - Tree Entity Types
//!
//! Pure data structures shared by every crate in the workspace: node
//! identity, the materialized-path `Node`, entity kinds, concrete tree
//! entities, errors and configuration. Storage and caching live in
//! `canopy-storage`.

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;
pub mod node;

pub use config::{CacheConfig, CanopyConfig};
pub use entities::{DataType, EntityContainer, MoveEvent};
pub use enums::{CacheMode, EntityKind, NameConflictPolicy, ValueStorageType};
pub use error::{CanopyError, CanopyResult, ConfigError, StorageError, TreeError};
pub use identity::{
    has_identity, new_entity_key, new_scope_id, EntityKey, NodeId, ScopeId, Timestamp, ROOT_ID,
    UNSET_ID,
};
pub use node::{names_equal, Node, NodePath};
