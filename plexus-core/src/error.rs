//! Error types for plexus-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::loader::LoadContextError;
use crate::plugins::PluginHostError;
use crate::providers::ContractId;

/// Boxed error produced by a provider call or an executor
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for plexus-core
#[derive(Error, Debug)]
pub enum PlexusError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Fan-out error: {0}")]
    Aggregate(#[from] AggregateFailure),

    #[error("Invocation error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Load context error: {0}")]
    LoadContext(#[from] LoadContextError),

    #[error("Plugin host error: {0}")]
    PluginHost(#[from] PluginHostError),
}

/// Errors from the provider registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Provider '{provider_id}' is already registered for contract {contract}")]
    DuplicateProviderId {
        contract: ContractId,
        provider_id: String,
    },
}

/// Errors from the selection strategies.
///
/// "No provider matched" is never an error; it is an empty selection.
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Filter predicate '{predicate}' failed: {reason}")]
    InvalidFilterCriteria { predicate: String, reason: String },
}

/// Errors raised by an [`Executor`](crate::executor::Executor) around a provider call
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Call in category '{category}' was cancelled")]
    Cancelled { category: String },
}

/// One provider's failure inside a fan-out
#[derive(Error, Debug)]
#[error("provider '{provider_id}' failed: {error}")]
pub struct ProviderFailure {
    pub provider_id: String,
    #[source]
    pub error: BoxError,
}

/// Every failure observed by a fan-out, never collapsed to "some failed".
///
/// Under the continue policy `successes` holds the result of every provider
/// that did not fail. Under fail-fast it carries exactly the first observed
/// failure and no successes.
#[derive(Error, Debug)]
#[error("{} of {attempted} provider call(s) failed{}", .failures.len(), list_failures(.failures))]
pub struct AggregateFailure<T = ()> {
    /// Number of providers the operation was started against
    pub attempted: usize,
    pub failures: Vec<ProviderFailure>,
    pub successes: Vec<T>,
}

impl<T> AggregateFailure<T> {
    /// Ids of the providers that failed, in the order the failures were observed
    pub fn provider_ids(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|f| f.provider_id.as_str())
            .collect()
    }

    /// Drop the partial results, keeping only the failure report
    pub fn without_successes(self) -> AggregateFailure {
        AggregateFailure {
            attempted: self.attempted,
            failures: self.failures,
            successes: Vec::new(),
        }
    }
}

fn list_failures(failures: &[ProviderFailure]) -> String {
    failures.iter().map(|f| format!("; {f}")).collect()
}

/// Errors from invoking providers through a [`Providers`](crate::providers::Providers) accessor.
///
/// `T` is the per-provider result type of a fan-out, carried by
/// [`InvokeError::Aggregate`] for the providers that succeeded.
#[derive(Error, Debug)]
pub enum InvokeError<T = ()> {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Provider(#[from] ProviderFailure),

    #[error(transparent)]
    Aggregate(#[from] AggregateFailure<T>),
}

/// Best-effort message of a caught panic
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
