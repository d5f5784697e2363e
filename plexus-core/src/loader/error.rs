//! Load context error types

use std::path::PathBuf;

use thiserror::Error;

use super::context::LoadContextState;

/// Errors a [`CodeUnitLoader`](super::CodeUnitLoader) reports for one code unit
#[derive(Error, Debug)]
pub enum CodeUnitError {
    /// API version mismatch between host and code unit
    #[error("API version mismatch: host expects {expected}, code unit has {found}")]
    ApiVersionMismatch { expected: u32, found: u32 },

    /// Failed to open the library or resolve a required symbol
    #[error("Failed to load library: {0}")]
    Library(#[from] libloading::Error),

    /// No factory table is registered under this path
    #[error("No factory table registered for {path}")]
    UnknownFactoryTable { path: PathBuf },

    /// The unit exports no entry types
    #[error("Code unit exports no entry types")]
    EmptyEntryTable,

    /// The unit is already loaded into this context
    #[error("Code unit is already loaded into this context")]
    AlreadyLoaded,

    /// Another live context holds the same library, which the platform would share
    #[error("{path} is already loaded by another context")]
    PathInUse { path: PathBuf },
}

/// Errors from the load context manager
#[derive(Error, Debug)]
pub enum LoadContextError {
    /// The loader cannot isolate, or the name belongs to a live context
    #[error("Cannot create load context '{name}': {reason}")]
    ContextCreationFailed { name: String, reason: String },

    /// A code unit is missing, malformed, or already loaded
    #[error("Failed to load {path} into context '{context}': {source}")]
    LoadFailure {
        context: String,
        path: PathBuf,
        #[source]
        source: CodeUnitError,
    },

    /// The entry type has no zero-argument constructor, or it panicked
    #[error("Cannot instantiate '{type_name}': {reason}")]
    InstantiationFailure { type_name: String, reason: String },

    /// Operation not valid in the context's current state
    #[error("Load context '{name}' is {state}, cannot {operation}")]
    InvalidState {
        name: String,
        state: LoadContextState,
        operation: &'static str,
    },
}
