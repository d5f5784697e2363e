//! PluginContext - the bounded view of the host a plugin gets while configuring

use crate::error::PluginError;
use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ─── Service Access ──────────────────────────────────────────────────

/// Host-side services a plugin may look up by name.
///
/// Services are stored as `Arc<dyn Any>`; for trait objects register an
/// `Arc<Arc<dyn Trait>>` and ask for `T = Arc<dyn Trait>`.
pub trait ServiceAccessor: Send + Sync {
    /// Look up a service by name
    fn get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Simple name-keyed service table
#[derive(Default, Clone)]
pub struct ServiceMap {
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceMap {
    /// Create an empty service table
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a service under `name`
    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<String>, service: Arc<T>) -> Self {
        self.insert(name, service);
        self
    }

    /// Add or replace a service
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, service: Arc<T>) {
        self.services.insert(name.into(), service);
    }
}

impl ServiceAccessor for ServiceMap {
    fn get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(name).cloned()
    }
}

// ─── Timers ──────────────────────────────────────────────────────────

/// Future returned by [`Timer::sleep`]
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Timer driven by the host's async runtime.
///
/// A plugin built as a `cdylib` links its own copy of any runtime crate, and
/// that copy never has a runtime entered. Plugins sleep through this instead
/// of calling the runtime's timer functions directly.
pub trait Timer: Send + Sync {
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

// ─── Context ─────────────────────────────────────────────────────────

/// Plugin's interface to the host during `configure`.
///
/// Holds the plugin's identity and directory, its persistent configuration,
/// named host services, the host timer and the host shutdown signal.
pub struct PluginContext {
    plugin_id: String,
    plugin_dir: PathBuf,
    config: PluginConfig,
    services: Arc<dyn ServiceAccessor>,
    timer: Option<Arc<dyn Timer>>,
    shutdown: CancellationToken,
}

impl PluginContext {
    /// Create a context with no services and an empty config
    pub fn new(plugin_id: String, plugin_dir: PathBuf) -> Self {
        Self {
            plugin_id,
            plugin_dir,
            config: PluginConfig::new(),
            services: Arc::new(ServiceMap::new()),
            timer: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Builder: use a pre-loaded config
    pub fn with_config(mut self, config: PluginConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder: set the host service accessor
    pub fn with_services(mut self, services: Arc<dyn ServiceAccessor>) -> Self {
        self.services = services;
        self
    }

    /// Builder: set the host timer
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Builder: set the host shutdown signal
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    // ─── Identity ────────────────────────────────────────────────────

    /// Get the plugin's id
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Get the plugin's directory (for storing data files)
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// The host's shutdown signal
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The host's timer, if it provides one
    pub fn timer(&self) -> Option<Arc<dyn Timer>> {
        self.timer.clone()
    }

    // ─── Services ────────────────────────────────────────────────────

    /// Look up a host service and downcast it to `T`
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .get(name)
            .and_then(|svc| svc.downcast::<T>().ok())
    }

    /// Like [`service`](Self::service), but a missing service is an error
    pub fn require_service<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, PluginError> {
        self.service(name)
            .ok_or_else(|| PluginError::ServiceUnavailable(name.to_string()))
    }

    // ─── Configuration ───────────────────────────────────────────────

    /// Read a configuration value
    pub fn config_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config.get(key)
    }

    /// Write a configuration value
    pub fn config_set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), PluginError> {
        self.config.set(key, value)
    }

    /// Get a mutable reference to the config (for the host to persist)
    pub fn config_mut(&mut self) -> &mut PluginConfig {
        &mut self.config
    }

    // ─── Logging ─────────────────────────────────────────────────────

    /// Log an info message (automatically prefixed with plugin id)
    pub fn log_info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin_id, "{}", message);
    }

    /// Log a warning message
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin_id, "{}", message);
    }

    /// Log an error message
    pub fn log_error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin_id, "{}", message);
    }

    /// Log a debug message
    pub fn log_debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin_id, "{}", message);
    }
}

// ─── Config ──────────────────────────────────────────────────────────

/// Plugin configuration - persistent key-value store backed by TOML
#[derive(Debug, Clone)]
pub struct PluginConfig {
    values: HashMap<String, toml::Value>,
    dirty: bool,
}

impl PluginConfig {
    /// Create a new empty config
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            dirty: false,
        }
    }

    /// Load configuration from a TOML file; a missing file yields an empty config
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let values: HashMap<String, toml::Value> =
            toml::from_str(&content).map_err(|e| PluginError::Config(e.to_string()))?;
        Ok(Self {
            values,
            dirty: false,
        })
    }

    /// Save configuration to a TOML file
    pub fn save(&mut self, path: &Path) -> Result<(), PluginError> {
        let content = toml::to_string_pretty(&self.values)
            .map_err(|e| PluginError::Serialization(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.exists()) {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        self.dirty = false;
        Ok(())
    }

    /// Get a configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(|v| v.clone().try_into().ok())
    }

    /// Set a configuration value
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), PluginError> {
        let toml_value =
            toml::Value::try_from(value).map_err(|e| PluginError::Serialization(e.to_string()))?;
        self.values.insert(key.to_string(), toml_value);
        self.dirty = true;
        Ok(())
    }

    /// Check if the config has been modified since loading/saving
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self::new()
    }
}
