use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use plexus_core::{CategoryConfig, PluginHostConfig, RoutingConfig};
use semver::VersionReq;
use serde::{Deserialize, Serialize};

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPlexusConfig {
    #[serde(default)]
    pub routing: RawRoutingConfig,

    #[serde(default)]
    pub host: RawHostConfig,
}

/// Routing settings as stored in TOML
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawRoutingConfig {
    /// TTL for cached pick-one selections
    pub cache_ttl_ms: Option<u64>,

    /// Category name -> strategy settings; a later layer replaces a whole category
    #[serde(default)]
    pub categories: IndexMap<String, CategoryConfig>,
}

/// Plugin host settings as stored in TOML
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawHostConfig {
    /// Data directory for plugins without a code unit directory
    pub plugin_dir: Option<PathBuf>,

    /// How long to wait for a run hook to stop
    pub run_stop_timeout_ms: Option<u64>,

    /// Accepted contract versions, e.g. "^1"
    pub contract_version: Option<String>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlexusConfig {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub plugin_dir: PathBuf,
    pub run_stop_timeout_ms: u64,
    pub contract_version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        let defaults = PluginHostConfig::default();
        Self {
            plugin_dir: defaults.plugin_dir,
            run_stop_timeout_ms: DEFAULT_RUN_STOP_TIMEOUT_MS,
            contract_version: defaults.contract_version.to_string(),
        }
    }
}

/// Default run hook stop timeout
pub const DEFAULT_RUN_STOP_TIMEOUT_MS: u64 = 5_000;

impl PlexusConfig {
    /// Plugin host configuration described by the `[host]` section
    pub fn plugin_host_config(&self) -> Result<PluginHostConfig> {
        let contract_version = VersionReq::parse(&self.host.contract_version)
            .with_context(|| format!("Invalid contract_version '{}'", self.host.contract_version))?;
        Ok(PluginHostConfig {
            run_stop_timeout: Duration::from_millis(self.host.run_stop_timeout_ms),
            contract_version,
            plugin_dir: self.host.plugin_dir.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::StrategyType;

    #[test]
    fn test_default_values() {
        let config = PlexusConfig::default();
        assert!(config.routing.categories.is_empty());
        assert_eq!(config.host.run_stop_timeout_ms, DEFAULT_RUN_STOP_TIMEOUT_MS);
        assert_eq!(config.host.contract_version, "*");
    }

    #[test]
    fn test_raw_config_partial_parsing() {
        let toml_str = r#"
[host]
run_stop_timeout_ms = 250

[routing.categories.analytics]
strategy = "sharded"
shard_map = { system = "console" }
"#;
        let raw: RawPlexusConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(raw.host.run_stop_timeout_ms, Some(250));
        assert!(raw.host.contract_version.is_none());
        assert!(raw.routing.cache_ttl_ms.is_none());
        let analytics = raw.routing.categories.get("analytics").unwrap();
        assert_eq!(analytics.strategy, StrategyType::Sharded);
        assert_eq!(analytics.shard_map.get("system").unwrap(), "console");
    }

    #[test]
    fn test_plugin_host_config() {
        let mut config = PlexusConfig::default();
        config.host.contract_version = "^1.2".to_string();
        config.host.run_stop_timeout_ms = 100;

        let host = config.plugin_host_config().unwrap();
        assert_eq!(host.run_stop_timeout, Duration::from_millis(100));
        assert!(host.contract_version.matches(&semver::Version::new(1, 4, 0)));
        assert!(!host.contract_version.matches(&semver::Version::new(2, 0, 0)));
    }

    #[test]
    fn test_invalid_contract_version_is_an_error() {
        let mut config = PlexusConfig::default();
        config.host.contract_version = "not a version".to_string();
        assert!(config.plugin_host_config().is_err());
    }
}
