//! Capability and plugin metadata structures

use std::collections::BTreeSet;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Free-form metadata attached to a provider or supplied with a call.
///
/// Insertion order is preserved so iteration (and anything derived from it)
/// is deterministic.
pub type Metadata = IndexMap<String, serde_json::Value>;

/// Priority tier of a provider registration. Higher tiers win pick-one selection.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Metadata describing what a provider can do.
///
/// Once attached to a registration the descriptor is shared behind an `Arc`
/// and never mutated; describing a provider differently means registering it
/// again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique within the registrations of one contract
    pub provider_id: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub platform_tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CapabilityDescriptor {
    /// Create a descriptor with `Normal` priority, no tags and no metadata
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    /// Builder: set the priority tier
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add a platform tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.platform_tags.insert(tag.into());
        self
    }

    /// Builder: append a metadata entry
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True when every tag in `required` is carried by this descriptor
    pub fn has_tags<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required
            .into_iter()
            .all(|tag| self.platform_tags.contains(tag))
    }
}

/// Everything the host needs to load one plugin.
///
/// Usually sourced from a manifest file; reading that file is the
/// application's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub version: semver::Version,
    /// Code units loaded, in order, into the plugin's load context
    pub code_unit_paths: Vec<PathBuf>,
    /// Name of the entry type the host instantiates
    pub entry_type_name: String,
    /// Version of the contracts the plugin was built against
    pub contract_version: String,
    #[serde(default)]
    pub capabilities: CapabilityDescriptor,
}

impl PluginDescriptor {
    /// Directory handed to the plugin as its data directory.
    ///
    /// This is the parent of the first code unit, or `None` when the
    /// descriptor lists no code units.
    pub fn plugin_dir(&self) -> Option<PathBuf> {
        self.code_unit_paths
            .first()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
    }
}
