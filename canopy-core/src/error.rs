//! Error types for Canopy operations

use crate::{EntityKind, NodeId};
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {kind:?} with id {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Write failed for {kind:?} with id {id}: {reason}")]
    WriteFailed {
        kind: EntityKind,
        id: NodeId,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Tree invariant violations detected before anything is written.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("Parent not found: {kind:?} parent {parent_id} does not resolve to a live node")]
    ParentNotFound { kind: EntityKind, parent_id: NodeId },

    #[error("Duplicate name: a {kind:?} named '{name}' already exists")]
    DuplicateName { kind: EntityKind, name: String },

    #[error("Invalid move: node {id} cannot be placed under its own descendant {target_id}")]
    InvalidMove { id: NodeId, target_id: NodeId },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Repository cache mode '{mode}' is not supported")]
    UnsupportedMode { mode: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Canopy errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CanopyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CanopyError {
    /// The requested entity has no live row. Callers usually map this to an
    /// empty result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CanopyError::Storage(StorageError::NotFound { .. }))
    }

    /// The write conflicts with the current tree (duplicate name, cycle).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CanopyError::Tree(TreeError::DuplicateName { .. } | TreeError::InvalidMove { .. })
        )
    }

    /// The store rejected or lost a write. Part of a multi-row write may
    /// already be persisted.
    pub fn is_write_failure(&self) -> bool {
        matches!(
            self,
            CanopyError::Storage(StorageError::WriteFailed { .. } | StorageError::LockPoisoned)
        )
    }

    /// Misconfiguration upstream; not something to recover from locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CanopyError::Config(ConfigError::UnsupportedMode { .. }))
    }
}

/// Result type alias for Canopy operations.
pub type CanopyResult<T> = Result<T, CanopyError>;

// =============================================================================
// TESTS
// =============================================================================
