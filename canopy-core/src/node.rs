//! The materialized-path tree primitive shared by every entity kind.
//!
//! A node never references another node in memory. Its place in the tree is
//! fully described by `parent_id`, `path` and `level`, and navigation always
//! goes back through a store by id.

use crate::{
    has_identity, new_entity_key, EntityKey, EntityKind, NodeId, Timestamp, TreeError, ROOT_ID,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = ',';

// ============================================================================
// NODE PATH
// ============================================================================

/// Comma separated ancestor chain from the root sentinel to the node itself,
/// e.g. `"-1,4,17,42"`.
///
/// A path is a descendant of another exactly when it starts with the other
/// path followed by a separator, which is what makes subtree queries a plain
/// prefix scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(String);

impl NodePath {
    /// Path of a root-level node.
    pub fn root(id: NodeId) -> Self {
        Self(format!("{}{}{}", ROOT_ID, SEPARATOR, id))
    }

    /// Path of a node placed directly under `parent`.
    pub fn child(parent: &NodePath, id: NodeId) -> Self {
        Self(format!("{}{}{}", parent.0, SEPARATOR, id))
    }

    /// Path under an optional parent; `None` means root level.
    pub fn under(parent: Option<&NodePath>, id: NodeId) -> Self {
        match parent {
            Some(parent) => Self::child(parent, id),
            None => Self::root(id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// False for nodes that have not been placed in a tree yet.
    pub fn is_assigned(&self) -> bool {
        !self.0.is_empty()
    }

    /// Ids along the path, sentinel first.
    pub fn ids(&self) -> Vec<NodeId> {
        if self.0.is_empty() {
            return Vec::new();
        }
        self.0
            .split(SEPARATOR)
            .filter_map(|segment| segment.parse().ok())
            .collect()
    }

    /// True if `id` appears anywhere on the path.
    pub fn contains(&self, id: NodeId) -> bool {
        self.ids().contains(&id)
    }

    /// Id of the node the path belongs to.
    pub fn last_id(&self) -> Option<NodeId> {
        self.0.rsplit(SEPARATOR).next()?.parse().ok()
    }

    /// Path of the parent, or `None` for root-level nodes.
    pub fn parent_path(&self) -> Option<NodePath> {
        let (parent, _) = self.0.rsplit_once(SEPARATOR)?;
        if parent == ROOT_ID.to_string() {
            None
        } else {
            Some(NodePath(parent.to_string()))
        }
    }

    /// Number of ancestors below the sentinel, i.e. 0 for root-level nodes.
    pub fn depth(&self) -> usize {
        self.ids().len().saturating_sub(2)
    }

    /// Prefix shared by the paths of every descendant.
    pub fn descendant_prefix(&self) -> String {
        format!("{}{}", self.0, SEPARATOR)
    }

    /// True if this path lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &NodePath) -> bool {
        ancestor.is_assigned() && self.0.starts_with(&ancestor.descendant_prefix())
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodePath {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TreeError::InvalidPath {
            path: s.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = s.split(SEPARATOR);
        match segments.next().map(str::parse::<NodeId>) {
            Some(Ok(ROOT_ID)) => {}
            _ => return Err(invalid("path must start with the root sentinel")),
        }

        let mut count = 0;
        for segment in segments {
            let id: NodeId = segment
                .parse()
                .map_err(|_| invalid("segment is not an integer id"))?;
            if id <= 0 {
                return Err(invalid("segment is not a persisted id"));
            }
            count += 1;
        }
        if count == 0 {
            return Err(invalid("path has no node segment"));
        }

        Ok(NodePath(s.to_string()))
    }
}

// ============================================================================
// NODE
// ============================================================================

/// One tree member. Entity kinds embed a `Node` and add their own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub key: EntityKey,
    pub kind: EntityKind,
    /// `ROOT_ID` for root-level nodes.
    pub parent_id: NodeId,
    pub path: NodePath,
    pub level: i32,
    pub sort_order: i32,
    pub name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

impl Node {
    /// A new, unsaved node. Id, path, level and sort order are assigned by
    /// the repository on create.
    pub fn new(kind: EntityKind, name: impl Into<String>, parent_id: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id: crate::UNSET_ID,
            key: new_entity_key(),
            kind,
            parent_id,
            path: NodePath::default(),
            level: 0,
            sort_order: 0,
            name: name.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// A new, unsaved root-level node.
    pub fn new_root(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::new(kind, name, ROOT_ID)
    }

    pub fn has_identity(&self) -> bool {
        has_identity(self.id)
    }

    /// False once the node has been logically deleted.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn is_root_level(&self) -> bool {
        self.parent_id == ROOT_ID
    }

    /// Case-insensitive name comparison used for uniqueness checks.
    pub fn name_matches(&self, name: &str) -> bool {
        names_equal(&self.name, name)
    }

    /// True if `other` sits strictly below this node.
    pub fn is_ancestor_of(&self, other: &Node) -> bool {
        other.path.is_descendant_of(&self.path)
    }
}

/// Case-insensitive comparison of two display names.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}
