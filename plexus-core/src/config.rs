//! Routing configuration
//!
//! ```toml
//! cache_ttl_ms = 30000
//!
//! [categories.analytics]
//! strategy = "sharded"
//! fallback_to_fan_out = false
//! shard_map = { player = "primary", system = "audit" }
//!
//! [categories.notifications]
//! strategy = "fan_out"
//! required_tags = ["desktop"]
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selection::StrategyType;

/// Default pick-one cache TTL in milliseconds
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;

fn default_cache_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

/// Errors reading configuration files
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Per-category selection strategy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// TTL for cached pick-one selections
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Category (contract) name -> strategy settings
    #[serde(default)]
    pub categories: IndexMap<String, CategoryConfig>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            categories: IndexMap::new(),
        }
    }
}

/// Strategy settings for one category
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryConfig {
    #[serde(default)]
    pub strategy: StrategyType,

    /// Platform tags every selected provider must carry
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_tags: BTreeSet<String>,

    /// Overrides the top-level TTL (pick-one only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,

    /// Shard key -> provider id (sharded only)
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub shard_map: IndexMap<String, String>,

    /// Call-metadata field holding the event name (sharded only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key_field: Option<String>,

    /// Select every eligible provider when the shard owner is missing
    #[serde(default)]
    pub fallback_to_fan_out: bool,
}

impl RoutingConfig {
    /// Parse from a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Load from a file; a missing file yields the default configuration
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Strategy settings for `category`, if configured
    pub fn category(&self, category: &str) -> Option<&CategoryConfig> {
        self.categories.get(category)
    }

    /// Effective pick-one TTL for `category`
    pub fn cache_ttl(&self, category: &str) -> Duration {
        let ms = self
            .category(category)
            .and_then(|c| c.cache_ttl_ms)
            .unwrap_or(self.cache_ttl_ms);
        Duration::from_millis(ms)
    }
}
