use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use plexus_core::RoutingConfig;
use plexus_core::config::DEFAULT_CACHE_TTL_MS;

use super::types::{
    DEFAULT_RUN_STOP_TIMEOUT_MS, HostConfig, PlexusConfig, RawHostConfig, RawPlexusConfig,
    RawRoutingConfig,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<PlexusConfig> {
        let mut raw = RawPlexusConfig::default();

        // Layer 1: User config
        if let Some(user_path) = Self::user_config_path()
            && user_path.exists()
        {
            raw = Self::merge_raw(raw, Self::read_raw(&user_path)?);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&project_path)?);
        }

        Ok(Self::finalize(raw))
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("plexus").join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with PLEXUS_PROJECT_CONFIG_DIR env var (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("PLEXUS_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".plexus/config.toml")
        }
    }

    fn read_raw(path: &Path) -> Result<RawPlexusConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawPlexusConfig, overlay: RawPlexusConfig) -> RawPlexusConfig {
        let mut categories = base.routing.categories;
        categories.extend(overlay.routing.categories);
        RawPlexusConfig {
            routing: RawRoutingConfig {
                cache_ttl_ms: overlay.routing.cache_ttl_ms.or(base.routing.cache_ttl_ms),
                categories,
            },
            host: RawHostConfig {
                plugin_dir: overlay.host.plugin_dir.or(base.host.plugin_dir),
                run_stop_timeout_ms: overlay
                    .host
                    .run_stop_timeout_ms
                    .or(base.host.run_stop_timeout_ms),
                contract_version: overlay.host.contract_version.or(base.host.contract_version),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawPlexusConfig) -> PlexusConfig {
        let defaults = HostConfig::default();
        PlexusConfig {
            routing: RoutingConfig {
                cache_ttl_ms: raw.routing.cache_ttl_ms.unwrap_or(DEFAULT_CACHE_TTL_MS),
                categories: raw.routing.categories,
            },
            host: HostConfig {
                plugin_dir: raw.host.plugin_dir.unwrap_or(defaults.plugin_dir),
                run_stop_timeout_ms: raw
                    .host
                    .run_stop_timeout_ms
                    .unwrap_or(DEFAULT_RUN_STOP_TIMEOUT_MS),
                contract_version: raw.host.contract_version.unwrap_or(defaults.contract_version),
            },
        }
    }

    /// Load config from a specific path (for testing)
    #[cfg(test)]
    pub fn load_from_path(path: &Path) -> Result<PlexusConfig> {
        if path.exists() {
            Ok(Self::finalize(Self::read_raw(path)?))
        } else {
            Ok(PlexusConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::{CategoryConfig, StrategyType};
    use tempfile::TempDir;

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigLoader::load_from_path(&temp_dir.path().join("none.toml")).unwrap();
        assert!(config.routing.categories.is_empty());
        assert_eq!(config.host.run_stop_timeout_ms, DEFAULT_RUN_STOP_TIMEOUT_MS);
    }

    #[test]
    fn test_load_from_valid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[host]
contract_version = "^1"

[routing]
cache_ttl_ms = 1000

[routing.categories.storage]
strategy = "fan_out"
required_tags = ["linux"]
"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.host.contract_version, "^1");
        assert_eq!(config.routing.cache_ttl_ms, 1000);
        let storage = config.routing.category("storage").unwrap();
        assert_eq!(storage.strategy, StrategyType::FanOut);
        assert!(storage.required_tags.contains("linux"));
    }

    #[test]
    fn test_load_invalid_toml_returns_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("invalid.toml");
        std::fs::write(&path, "this is not valid toml {{").unwrap();
        assert!(ConfigLoader::load_from_path(&path).is_err());
    }

    #[test]
    fn test_merge_raw_overlay_overrides_base() {
        let mut base_routing = RawRoutingConfig::default();
        base_routing.categories.insert(
            "analytics".into(),
            CategoryConfig {
                strategy: StrategyType::FanOut,
                ..Default::default()
            },
        );
        base_routing
            .categories
            .insert("storage".into(), CategoryConfig::default());
        let base = RawPlexusConfig {
            routing: base_routing,
            host: RawHostConfig {
                plugin_dir: Some(PathBuf::from("/base/plugins")),
                run_stop_timeout_ms: Some(1000),
                contract_version: None,
            },
        };

        let mut overlay_routing = RawRoutingConfig::default();
        overlay_routing.categories.insert(
            "analytics".into(),
            CategoryConfig {
                strategy: StrategyType::Sharded,
                ..Default::default()
            },
        );
        let overlay = RawPlexusConfig {
            routing: overlay_routing,
            host: RawHostConfig {
                plugin_dir: None,
                run_stop_timeout_ms: Some(250),
                contract_version: Some("^2".into()),
            },
        };

        let merged = ConfigLoader::merge_raw(base, overlay);
        assert_eq!(merged.host.plugin_dir, Some(PathBuf::from("/base/plugins")));
        assert_eq!(merged.host.run_stop_timeout_ms, Some(250));
        assert_eq!(merged.host.contract_version.as_deref(), Some("^2"));
        assert_eq!(
            merged.routing.categories["analytics"].strategy,
            StrategyType::Sharded
        );
        // Categories only the base configures survive
        assert!(merged.routing.categories.contains_key("storage"));
    }

    #[test]
    fn test_explicit_default_overrides_lower_layer() {
        let user: RawPlexusConfig = toml::from_str(
            r#"
[routing]
cache_ttl_ms = 1000

[host]
run_stop_timeout_ms = 250
"#,
        )
        .unwrap();
        let project: RawPlexusConfig = toml::from_str(&format!(
            "[routing]\ncache_ttl_ms = {DEFAULT_CACHE_TTL_MS}\n\n[host]\nrun_stop_timeout_ms = {DEFAULT_RUN_STOP_TIMEOUT_MS}\n"
        ))
        .unwrap();

        let config = ConfigLoader::finalize(ConfigLoader::merge_raw(user, project));
        assert_eq!(config.routing.cache_ttl_ms, DEFAULT_CACHE_TTL_MS);
        assert_eq!(config.host.run_stop_timeout_ms, DEFAULT_RUN_STOP_TIMEOUT_MS);
    }

    #[test]
    fn test_unset_values_keep_lower_layer() {
        let user: RawPlexusConfig = toml::from_str("[routing]\ncache_ttl_ms = 1000\n").unwrap();
        let project: RawPlexusConfig =
            toml::from_str("[routing.categories.storage]\nstrategy = \"fan_out\"\n").unwrap();

        let config = ConfigLoader::finalize(ConfigLoader::merge_raw(user, project));
        assert_eq!(config.routing.cache_ttl_ms, 1000);
        assert!(config.routing.category("storage").is_some());
    }

    #[test]
    fn test_user_config_path_names_plexus() {
        if let Some(path) = ConfigLoader::user_config_path() {
            assert!(path.to_string_lossy().contains("plexus"));
            assert!(path.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_project_config_path() {
        if std::env::var("PLEXUS_PROJECT_CONFIG_DIR").is_err() {
            assert_eq!(
                ConfigLoader::project_config_path(),
                PathBuf::from(".plexus/config.toml")
            );
        }
    }
}
