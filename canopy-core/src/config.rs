//! Configuration types

use crate::{CacheMode, CanopyError, CanopyResult, ConfigError, NameConflictPolicy};
use serde::{Deserialize, Serialize};

/// Repository cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries kept per entity type in one cache tier.
    pub max_entries_per_type: usize,
    /// Mode used by units of work that do not declare one.
    pub default_mode: CacheMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_type: 10_000,
            default_mode: CacheMode::Default,
        }
    }
}

impl CacheConfig {
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries_per_type = max;
        self
    }

    pub fn with_default_mode(mut self, mode: CacheMode) -> Self {
        self.default_mode = mode;
        self
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanopyConfig {
    /// Level assigned to root-level nodes.
    pub root_level: i32,
    pub name_conflict: NameConflictPolicy,
    pub cache: CacheConfig,
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            root_level: 0,
            name_conflict: NameConflictPolicy::Reject,
            cache: CacheConfig::default(),
        }
    }
}

impl CanopyConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CANOPY_ROOT_LEVEL`: level of root-level nodes (default: 0)
    /// - `CANOPY_NAME_CONFLICT`: `reject` or `suffix` (default: reject)
    /// - `CANOPY_CACHE_MAX_ENTRIES`: entries per entity type and tier (default: 10000)
    /// - `CANOPY_CACHE_DEFAULT_MODE`: `default`, `scoped` or `none` (default: default)
    ///
    /// Unparseable values fall back to the default; call [`validate`](Self::validate)
    /// afterwards to reject values that parse but make no sense.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            root_level: std::env::var("CANOPY_ROOT_LEVEL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.root_level),
            name_conflict: std::env::var("CANOPY_NAME_CONFLICT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.name_conflict),
            cache: CacheConfig {
                max_entries_per_type: std::env::var("CANOPY_CACHE_MAX_ENTRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.cache.max_entries_per_type),
                default_mode: std::env::var("CANOPY_CACHE_DEFAULT_MODE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.cache.default_mode),
            },
        }
    }

    pub fn with_name_conflict(mut self, policy: NameConflictPolicy) -> Self {
        self.name_conflict = policy;
        self
    }

    pub fn with_root_level(mut self, level: i32) -> Self {
        self.root_level = level;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - root_level >= 0
    /// - cache.max_entries_per_type > 0
    pub fn validate(&self) -> CanopyResult<()> {
        if self.root_level < 0 {
            return Err(CanopyError::Config(ConfigError::InvalidValue {
                field: "root_level".to_string(),
                value: self.root_level.to_string(),
                reason: "root_level must be non-negative".to_string(),
            }));
        }

        if self.cache.max_entries_per_type == 0 {
            return Err(CanopyError::Config(ConfigError::InvalidValue {
                field: "cache.max_entries_per_type".to_string(),
                value: self.cache.max_entries_per_type.to_string(),
                reason: "max_entries_per_type must be greater than 0".to_string(),
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CanopyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.root_level, 0);
        assert_eq!(config.name_conflict, NameConflictPolicy::Reject);
        assert_eq!(config.cache.default_mode, CacheMode::Default);
    }

    #[test]
    fn test_negative_root_level_rejected() {
        let err = CanopyConfig::default()
            .with_root_level(-1)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            CanopyError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "root_level"
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config =
            CanopyConfig::default().with_cache(CacheConfig::default().with_max_entries(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = CanopyConfig::default()
            .with_name_conflict(NameConflictPolicy::Suffix)
            .with_cache(CacheConfig::default().with_default_mode(CacheMode::Scoped));
        let json = serde_json::to_string(&config).unwrap();
        let back: CanopyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
