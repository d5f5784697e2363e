//! Plugin host error types

use std::sync::Arc;

use plexus_plugin_api::PluginError;
use thiserror::Error;

use super::host::PluginState;
use crate::error::RegistryError;
use crate::loader::LoadContextError;

/// Errors that can occur in the plugin host.
///
/// Cheap to clone so the same error can be returned to the caller and
/// published in a [`PluginEvent::Failed`](crate::events::PluginEvent::Failed).
#[derive(Error, Debug, Clone)]
pub enum PluginHostError {
    /// Any step of loading failed; nothing of the attempt is left behind
    #[error("Failed to load plugin '{id}': {source}")]
    PluginLoadFailed {
        id: String,
        #[source]
        source: Arc<LoadCause>,
    },

    /// Operation not valid in the plugin's current state
    #[error("Cannot {operation} plugin '{id}' while it is {from}")]
    InvalidStateTransition {
        id: String,
        from: PluginState,
        operation: &'static str,
    },

    /// The plugin's `can_unload` hook said no
    #[error("Plugin '{id}' refused to unload: {reason}")]
    UnloadRefused { id: String, reason: String },

    /// No plugin with this id is loaded
    #[error("Plugin '{id}' not found")]
    NotFound { id: String },

    /// A lifecycle hook returned an error or panicked
    #[error("Plugin '{id}' {hook} hook failed: {reason}")]
    HookFailed {
        id: String,
        hook: &'static str,
        reason: String,
    },

    /// The plugin does not provide the requested contract
    #[error("Plugin '{id}' does not provide contract '{category}'")]
    ContractMismatch { id: String, category: &'static str },

    /// Registering the plugin's provider was rejected
    #[error("Failed to register provider of plugin '{id}': {source}")]
    ProviderRegistration {
        id: String,
        #[source]
        source: Arc<RegistryError>,
    },
}

impl PluginHostError {
    /// Plugin id the error is about
    pub fn plugin_id(&self) -> &str {
        match self {
            PluginHostError::PluginLoadFailed { id, .. }
            | PluginHostError::InvalidStateTransition { id, .. }
            | PluginHostError::UnloadRefused { id, .. }
            | PluginHostError::NotFound { id }
            | PluginHostError::HookFailed { id, .. }
            | PluginHostError::ContractMismatch { id, .. }
            | PluginHostError::ProviderRegistration { id, .. } => id,
        }
    }
}

/// Underlying reason a plugin failed to load
#[derive(Error, Debug)]
pub enum LoadCause {
    #[error("descriptor lists no code units")]
    NoCodeUnits,

    #[error("invalid contract version '{0}'")]
    InvalidContractVersion(String),

    #[error("contract version {found} does not satisfy {required}")]
    IncompatibleContract { found: String, required: String },

    #[error("entry type '{0}' not found in any code unit")]
    EntryTypeNotFound(String),

    #[error(transparent)]
    LoadContext(#[from] LoadContextError),

    #[error("configure hook failed: {0}")]
    Configure(#[from] PluginError),

    #[error("configure hook panicked: {0}")]
    ConfigurePanicked(String),
}
