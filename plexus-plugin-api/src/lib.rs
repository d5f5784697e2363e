//! plexus-plugin-api - types shared between the plexus host and plugin code units
//!
//! This crate defines:
//!
//! - [`Contract`]: marker for capability interfaces that several providers implement
//! - [`CapabilityDescriptor`] and [`PluginDescriptor`]: provider and plugin metadata
//! - [`Plugin`]: the entry type a plugin exports, with its lifecycle hooks
//! - [`export_plugin!`]: generates the symbols the host's loader resolves
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use plexus_plugin_api::{Contract, Plugin, PluginContext, PluginError, export_plugin, provide};
//!
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self, name: &str) -> String;
//! }
//!
//! impl Contract for dyn Greeter {
//!     const CATEGORY: &'static str = "greeter";
//! }
//!
//! #[derive(Default)]
//! pub struct HelloPlugin;
//!
//! impl Greeter for HelloPlugin {
//!     fn greet(&self, name: &str) -> String {
//!         format!("hello, {name}")
//!     }
//! }
//!
//! #[async_trait::async_trait]
//! impl Plugin for HelloPlugin {
//!     async fn configure(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
//!         ctx.log_info("configured");
//!         Ok(())
//!     }
//!
//!     fn provide(&self, category: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
//!         (category == <dyn Greeter>::CATEGORY)
//!             .then(|| provide::<dyn Greeter>(Arc::new(HelloPlugin)))
//!     }
//! }
//!
//! export_plugin!(HelloPlugin);
//! ```

pub mod context;
pub mod error;
pub mod types;

pub use context::{PluginConfig, PluginContext, ServiceAccessor, ServiceMap, SleepFuture, Timer};
pub use error::PluginError;
pub use types::*;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

/// Current plugin API version. Code units must match this exactly.
pub const API_VERSION: u32 = 1;

/// Symbol exporting [`API_VERSION`] from a code unit
pub const API_VERSION_SYMBOL: &[u8] = b"_plexus_plugin_api_version";

/// Symbol exporting the code unit's [`EntryTypeDecl`] table
pub const ENTRY_TABLE_SYMBOL: &[u8] = b"_plexus_plugin_entry_types";

/// A capability interface that several providers can implement.
///
/// Implemented on the trait object type of the contract:
///
/// ```ignore
/// impl Contract for dyn Analytics {
///     const CATEGORY: &'static str = "analytics";
/// }
/// ```
pub trait Contract: Send + Sync + 'static {
    /// Routing-configuration key for this contract
    const CATEGORY: &'static str;
}

/// Box a contract implementation for [`Plugin::provide`]
pub fn provide<C: Contract + ?Sized>(provider: Arc<C>) -> Arc<dyn Any + Send + Sync> {
    Arc::new(provider)
}

/// Future returned by a plugin's run hook
pub type RunFuture = Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + 'static>>;

/// Box a run hook, turning a panic inside it into [`PluginError::Panicked`].
///
/// A panic cannot unwind out of a `cdylib` into the host, so a plugin built
/// that way has to catch its own.
pub fn guard_run<F>(run: F) -> RunFuture
where
    F: Future<Output = Result<(), PluginError>> + Send + 'static,
{
    Box::pin(AssertUnwindSafe(run).catch_unwind().map(|outcome| {
        outcome.unwrap_or_else(|panic| {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(PluginError::Panicked(message))
        })
    }))
}

/// Answer to the host's "may I unload you" question
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadVerdict {
    Allow,
    Refuse { reason: String },
}

/// The entry type of a plugin.
///
/// Every hook has a default, so a plugin only overrides what it needs.
/// The host drives the hooks in this order: `configure` once after
/// instantiation, `run` on activation, `can_unload` then `prepare_unload`
/// on deactivation.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Called once after instantiation, before the plugin is shared
    async fn configure(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Long-running work started on activation.
    ///
    /// Return `None` if the plugin has nothing to run. The returned future
    /// should finish promptly once `shutdown` is cancelled.
    fn run(self: Arc<Self>, _shutdown: CancellationToken) -> Option<RunFuture> {
        None
    }

    /// Whether the plugin is willing to be deactivated right now
    async fn can_unload(&self) -> UnloadVerdict {
        UnloadVerdict::Allow
    }

    /// Last chance to flush state before deactivation
    async fn prepare_unload(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Implementation of the contract registered under `category`, if any.
    ///
    /// Use [`provide`] to build the return value.
    fn provide(&self, _category: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// Zero-argument constructor for an entry type
pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// One row of a code unit's entry-type table
#[derive(Debug, Clone, Copy)]
pub struct EntryTypeDecl {
    /// Name the host looks the type up by
    pub name: &'static str,
    /// `None` for types that cannot be constructed without arguments
    pub create: Option<PluginFactory>,
}

/// Construct `T` through its `Default` impl (used by [`export_plugin!`])
pub fn construct<T: Plugin + Default>() -> Box<dyn Plugin> {
    Box::new(T::default())
}

/// Export plugin entry types for dynamic loading.
///
/// # Usage
///
/// ```ignore
/// plexus_plugin_api::export_plugin!(MyPlugin, MyOtherPlugin);
/// ```
///
/// # Generated Functions
///
/// - `_plexus_plugin_api_version()`: Returns the API version
/// - `_plexus_plugin_entry_types()`: Returns the entry-type table, one row
///   per listed type, named as written in the macro invocation
#[macro_export]
macro_rules! export_plugin {
    ($($plugin_type:ty),+ $(,)?) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _plexus_plugin_api_version() -> u32 {
            $crate::API_VERSION
        }

        #[unsafe(no_mangle)]
        pub fn _plexus_plugin_entry_types() -> &'static [$crate::EntryTypeDecl] {
            static TYPES: &[$crate::EntryTypeDecl] = &[$(
                $crate::EntryTypeDecl {
                    name: stringify!($plugin_type),
                    create: Some($crate::construct::<$plugin_type>),
                }
            ),+];
            TYPES
        }
    };
}
