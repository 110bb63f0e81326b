//! Enum types for tree entities and repository caching

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENTITY KINDS
// ============================================================================

/// Discriminator partitioning the tree namespace.
///
/// Paths, levels, sort orders and name uniqueness are all computed
/// independently per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    DataType,
    DataTypeContainer,
    DocumentType,
    DocumentTypeContainer,
    MediaType,
    MediaTypeContainer,
    Document,
    Media,
}

impl EntityKind {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EntityKind::DataType => "DataType",
            EntityKind::DataTypeContainer => "DataTypeContainer",
            EntityKind::DocumentType => "DocumentType",
            EntityKind::DocumentTypeContainer => "DocumentTypeContainer",
            EntityKind::MediaType => "MediaType",
            EntityKind::MediaTypeContainer => "MediaTypeContainer",
            EntityKind::Document => "Document",
            EntityKind::Media => "Media",
        }
    }

    /// True for folder kinds, which only group other entities.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            EntityKind::DataTypeContainer
                | EntityKind::DocumentTypeContainer
                | EntityKind::MediaTypeContainer
        )
    }

    /// The container kind used to organise entities of this kind, if any.
    pub fn container_kind(&self) -> Option<EntityKind> {
        match self {
            EntityKind::DataType => Some(EntityKind::DataTypeContainer),
            EntityKind::DocumentType => Some(EntityKind::DocumentTypeContainer),
            EntityKind::MediaType => Some(EntityKind::MediaTypeContainer),
            _ => None,
        }
    }
}

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "datatype" => Ok(EntityKind::DataType),
            "datatypecontainer" => Ok(EntityKind::DataTypeContainer),
            "documenttype" | "contenttype" => Ok(EntityKind::DocumentType),
            "documenttypecontainer" | "contenttypecontainer" => {
                Ok(EntityKind::DocumentTypeContainer)
            }
            "mediatype" => Ok(EntityKind::MediaType),
            "mediatypecontainer" => Ok(EntityKind::MediaTypeContainer),
            "document" | "content" => Ok(EntityKind::Document),
            "media" => Ok(EntityKind::Media),
            _ => Err(format!("Invalid EntityKind: {}", s)),
        }
    }
}

// ============================================================================
// CACHE MODE
// ============================================================================

/// Repository cache mode declared by a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Shared global tier.
    #[default]
    Default,
    /// Tier isolated to the unit of work, discarded when it ends.
    Scoped,
    /// No caching at all.
    None,
}

impl CacheMode {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            CacheMode::Default => "default",
            CacheMode::Scoped => "scoped",
            CacheMode::None => "none",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for CacheMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "default" => Ok(CacheMode::Default),
            "scoped" => Ok(CacheMode::Scoped),
            "none" => Ok(CacheMode::None),
            _ => Err(ConfigError::UnsupportedMode {
                mode: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// NAME CONFLICTS
// ============================================================================

/// What the repository does when a name is already taken within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NameConflictPolicy {
    /// Fail with a duplicate-name error.
    #[default]
    Reject,
    /// Rename to the first free `"{name} ({n})"`.
    Suffix,
}

impl fmt::Display for NameConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            NameConflictPolicy::Reject => "Reject",
            NameConflictPolicy::Suffix => "Suffix",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for NameConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "reject" => Ok(NameConflictPolicy::Reject),
            "suffix" | "rename" => Ok(NameConflictPolicy::Suffix),
            _ => Err(format!("Invalid NameConflictPolicy: {}", s)),
        }
    }
}

// ============================================================================
// DATA TYPE STORAGE
// ============================================================================

/// Column family a data type's property values are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueStorageType {
    Integer,
    Decimal,
    Date,
    Nvarchar,
    #[default]
    Ntext,
}

impl fmt::Display for ValueStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ValueStorageType::Integer => "Integer",
            ValueStorageType::Decimal => "Decimal",
            ValueStorageType::Date => "Date",
            ValueStorageType::Nvarchar => "Nvarchar",
            ValueStorageType::Ntext => "Ntext",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for ValueStorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "integer" | "int" => Ok(ValueStorageType::Integer),
            "decimal" => Ok(ValueStorageType::Decimal),
            "date" | "datetime" => Ok(ValueStorageType::Date),
            "nvarchar" | "string" => Ok(ValueStorageType::Nvarchar),
            "ntext" | "text" => Ok(ValueStorageType::Ntext),
            _ => Err(format!("Invalid ValueStorageType: {}", s)),
        }
    }
}
