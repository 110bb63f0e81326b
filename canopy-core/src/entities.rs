//! Tree entity structures

use crate::{EntityKind, Node, NodeId, NodePath, ValueStorageType, ROOT_ID};
use serde::{Deserialize, Serialize};

/// Data type - a configured property editor that document and media types
/// reference for their properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataType {
    pub node: Node,
    /// Alias of the property editor backing this data type.
    pub editor_alias: String,
    pub value_storage: ValueStorageType,
    /// Editor specific configuration.
    pub configuration: serde_json::Value,
}

impl DataType {
    /// A new, unsaved data type at root level.
    pub fn new(name: impl Into<String>, editor_alias: impl Into<String>) -> Self {
        Self {
            node: Node::new(EntityKind::DataType, name, ROOT_ID),
            editor_alias: editor_alias.into(),
            value_storage: ValueStorageType::default(),
            configuration: serde_json::Value::Null,
        }
    }

    /// Place the data type under a parent (usually a container) before create.
    pub fn with_parent(mut self, parent_id: NodeId) -> Self {
        self.node.parent_id = parent_id;
        self
    }

    pub fn with_value_storage(mut self, value_storage: ValueStorageType) -> Self {
        self.value_storage = value_storage;
        self
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }
}

/// Entity container - a folder grouping entities of one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContainer {
    pub node: Node,
}

impl EntityContainer {
    /// A new, unsaved container. `kind` must be one of the container kinds.
    pub fn new(kind: EntityKind, name: impl Into<String>, parent_id: NodeId) -> Self {
        debug_assert!(kind.is_container(), "{kind} is not a container kind");
        Self {
            node: Node::new(kind, name, parent_id),
        }
    }

    /// Kind of the entities this container holds.
    pub fn contained_kind(&self) -> Option<EntityKind> {
        match self.node.kind {
            EntityKind::DataTypeContainer => Some(EntityKind::DataType),
            EntityKind::DocumentTypeContainer => Some(EntityKind::DocumentType),
            EntityKind::MediaTypeContainer => Some(EntityKind::MediaType),
            _ => None,
        }
    }
}

/// One relocated entity, as reported by a move.
///
/// `entity` is the post-move state; `previous_path` and `previous_parent_id`
/// are what it had before the move started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEvent<T> {
    pub entity: T,
    pub previous_path: NodePath,
    pub previous_parent_id: NodeId,
}

impl<T> MoveEvent<T> {
    pub fn new(entity: T, previous_path: NodePath, previous_parent_id: NodeId) -> Self {
        Self {
            entity,
            previous_path,
            previous_parent_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_builder() {
        let dt = DataType::new("Textstring", "Canopy.Textbox")
            .with_parent(12)
            .with_value_storage(ValueStorageType::Nvarchar)
            .with_configuration(serde_json::json!({ "maxChars": 500 }));

        assert_eq!(dt.node.kind, EntityKind::DataType);
        assert_eq!(dt.node.parent_id, 12);
        assert_eq!(dt.value_storage, ValueStorageType::Nvarchar);
        assert_eq!(dt.configuration["maxChars"], 500);
    }

    #[test]
    fn test_container_contained_kind() {
        let folder = EntityContainer::new(EntityKind::MediaTypeContainer, "Images", ROOT_ID);
        assert_eq!(folder.contained_kind(), Some(EntityKind::MediaType));
    }
}
