//! Lifecycle and registry notifications
//!
//! Both channels are `tokio::sync::broadcast`: every subscriber sees every
//! event published after it subscribed, and publishing never blocks.

use std::sync::Arc;

use plexus_plugin_api::PluginDescriptor;

use crate::plugins::PluginHostError;
use crate::providers::ContractId;

/// Default broadcast capacity for event channels
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notification from the provider registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The published registration set of `contract` changed
    RegistrationsChanged { contract: ContractId },
}

/// Notification from the plugin host
#[derive(Debug, Clone)]
pub enum PluginEvent {
    Loaded {
        id: String,
        descriptor: PluginDescriptor,
    },
    Activated {
        id: String,
    },
    Deactivated {
        id: String,
    },
    Unloaded {
        id: String,
        descriptor: PluginDescriptor,
        /// Whether the load context actually reclaimed its code
        unloaded: bool,
    },
    /// A transition failed; the plugin stays in its last good state
    Failed {
        id: String,
        operation: &'static str,
        error: Arc<PluginHostError>,
    },
}

impl PluginEvent {
    /// Plugin id the event is about
    pub fn plugin_id(&self) -> &str {
        match self {
            PluginEvent::Loaded { id, .. }
            | PluginEvent::Activated { id }
            | PluginEvent::Deactivated { id }
            | PluginEvent::Unloaded { id, .. }
            | PluginEvent::Failed { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_id_is_extracted_from_every_variant() {
        let failed = PluginEvent::Failed {
            id: "p1".into(),
            operation: "activate",
            error: Arc::new(PluginHostError::NotFound { id: "p1".into() }),
        };
        assert_eq!(failed.plugin_id(), "p1");
        assert_eq!(PluginEvent::Activated { id: "p2".into() }.plugin_id(), "p2");
    }
}
