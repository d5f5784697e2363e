//! Plugin lifecycle host
//!
//! - [`PluginHost`]: loads, activates, deactivates and unloads plugins
//! - [`PluginHostError`]: error types for plugin operations
//!
//! # Lifecycle
//!
//! ```text
//! NotLoaded --load--> Loaded --activate--> Active --deactivate--> Inactive --unload--> Unloaded
//!                        └──────────────deactivate──────────────────┘
//! ```
//!
//! `force_unload` jumps from any loaded state to `Unloaded`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use plexus_core::loader::DylibLoader;
//! use plexus_core::plugins::{PluginHost, PluginHostConfig};
//! use plexus_core::providers::ProviderRegistry;
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! let host = PluginHost::new(PluginHostConfig::default(), Arc::new(DylibLoader::new()), registry);
//!
//! let handle = host.load_plugin(descriptor).await?;
//! host.register_provider::<dyn Analytics>(&handle.id).await?;
//! host.activate(&handle.id).await?;
//!
//! host.deactivate(&handle.id).await?;
//! let outcome = host.unload(&handle.id).await?;
//! if !outcome.unloaded {
//!     tracing::warn!("plugin code is still mapped");
//! }
//! ```

mod error;
mod host;

pub use error::{LoadCause, PluginHostError};
pub use host::{PluginHandle, PluginHost, PluginHostConfig, PluginState};
