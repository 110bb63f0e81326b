//! Identity types for tree entities

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Store-assigned integer identity of a tree node.
pub type NodeId = i32;

/// Parent id of every root-level node, and the first segment of every path.
pub const ROOT_ID: NodeId = -1;

/// Id carried by an entity that has not been persisted yet.
pub const UNSET_ID: NodeId = 0;

/// Stable key of a node, independent of its integer id.
/// UUIDv7 keeps keys sortable by creation time.
pub type EntityKey = Uuid;

/// Identifier of a unit of work (repository scope).
pub type ScopeId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 entity key.
pub fn new_entity_key() -> EntityKey {
    Uuid::now_v7()
}

/// Generate a new UUIDv7 scope id.
pub fn new_scope_id() -> ScopeId {
    Uuid::now_v7()
}

/// True if the id has been assigned by a store.
pub fn has_identity(id: NodeId) -> bool {
    id != UNSET_ID
}
