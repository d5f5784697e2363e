//! plexus-core: provider registry, selection strategies and plugin lifecycle host
//!
//! This crate provides:
//!
//! - **Provider registry** - [`ProviderRegistry`] maps a contract to its registered providers
//! - **Selection** - [`SelectionStrategy`] (pick-one, fan-out, sharded) and the [`Router`]
//!   that resolves a strategy per contract category from [`RoutingConfig`]
//! - **Fan-out** - [`fanout`] runs one operation against many providers under an [`ErrorPolicy`]
//! - **Load contexts** - [`loader`] loads plugin code units into isolated, releasable contexts
//! - **Plugin host** - [`PluginHost`] drives each plugin through its lifecycle
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use plexus_core::{ProviderRegistry, Router, RoutingConfig, SelectionContext};
//! use plexus_plugin_api::CapabilityDescriptor;
//!
//! let registry = ProviderRegistry::new();
//! registry.register::<dyn Analytics>(Arc::new(Console), CapabilityDescriptor::new("console"))?;
//!
//! let router = Router::from_config(&RoutingConfig::load(path)?);
//! let providers = registry.providers::<dyn Analytics>();
//! let ctx = providers.context().with_field("event", "player.level.complete");
//! providers
//!     .invoke_all(&router.strategy_for::<dyn Analytics>(), ctx, Default::default(), |p, _| async move {
//!         p.track("player.level.complete").await
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod fanout;
pub mod loader;
pub mod plugins;
pub mod providers;
pub mod selection;

// Re-export key types for convenience
pub use config::{CategoryConfig, ConfigError, RoutingConfig};
pub use error::{
    AggregateFailure, BoxError, ExecutorError, InvokeError, PlexusError, ProviderFailure,
    RegistryError, SelectionError,
};
pub use events::{PluginEvent, RegistryEvent};
pub use executor::{DirectExecutor, Executor};
pub use fanout::ErrorPolicy;
pub use loader::{
    CodeUnitLoader, DylibLoader, FactoryTableLoader, LoadContext, LoadContextManager,
    ReleaseOutcome,
};
pub use plugins::{PluginHandle, PluginHost, PluginHostConfig, PluginHostError, PluginState};
pub use providers::{ContractId, ProviderRegistry, Providers, Registration};
pub use selection::{
    FanOut, PickOne, Router, SelectionCache, SelectionContext, SelectionFilter, SelectionResult,
    SelectionStrategy, Sharded, StrategyType,
};
