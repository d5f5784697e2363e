//! Load context manager
//!
//! A load context is the namespace a plugin's code units are loaded into.
//! Entry types are looked up per context, instances created from a context
//! are tracked by it, and releasing it is the single point where the code is
//! reclaimed.
//!
//! Loaders report up front what they can do ([`LoaderCapabilities`]):
//!
//! - [`DylibLoader`]: shared libraries via `libloading`; isolated and reclaimable,
//!   with at most one live context per library path
//! - [`FactoryTableLoader`]: in-process factory tables; isolated, never reclaimed

mod context;
mod dylib;
mod error;
mod factory;

pub use context::{LoadContext, LoadContextManager, LoadContextState, ReleaseOutcome};
pub use dylib::DylibLoader;
pub use error::{CodeUnitError, LoadContextError};
pub use factory::FactoryTableLoader;

use std::path::{Path, PathBuf};

use libloading::Library;
use plexus_plugin_api::EntryTypeDecl;

/// What a loader's platform supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderCapabilities {
    /// Each context gets its own type namespace
    pub isolation: bool,
    /// Releasing a context unmaps its code
    pub reclaim: bool,
}

/// Resolves a code-unit path into an entry-type table
pub trait CodeUnitLoader: Send + Sync {
    fn capabilities(&self) -> LoaderCapabilities;

    /// Load the code unit at `path`
    fn load(&self, path: &Path) -> Result<CodeUnit, CodeUnitError>;
}

/// One loaded code unit.
///
/// The entry types point into the unit's code and are only valid while the
/// unit stays loaded.
pub struct CodeUnit {
    path: PathBuf,
    entry_types: Vec<EntryTypeDecl>,
    library: Option<Library>,
    claim: Option<dylib::PathClaim>,
}

impl CodeUnit {
    pub fn new(path: impl Into<PathBuf>, entry_types: Vec<EntryTypeDecl>) -> Self {
        Self {
            path: path.into(),
            entry_types,
            library: None,
            claim: None,
        }
    }

    /// Builder: keep `library` open for as long as the unit lives
    pub fn with_library(mut self, library: Library) -> Self {
        self.library = Some(library);
        self
    }

    fn with_claim(mut self, claim: dylib::PathClaim) -> Self {
        self.claim = Some(claim);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of the entry types the unit exports, in table order
    pub fn type_names(&self) -> Vec<&'static str> {
        self.entry_types.iter().map(|t| t.name).collect()
    }

    fn find(&self, name: &str) -> Option<EntryTypeDecl> {
        self.entry_types.iter().find(|t| t.name == name).copied()
    }

    /// Close the library, if any. Returns whether code was unmapped.
    ///
    /// The unit's path claim is given up once the library is closed.
    fn close(self) -> Result<bool, libloading::Error> {
        match self.library {
            Some(library) => library.close().map(|()| true),
            None => Ok(false),
        }
    }

    /// Keep the code mapped for the rest of the process.
    ///
    /// The path stays claimed too: loading it again would share the
    /// leaked code's statics.
    fn leak(self) {
        if let Some(library) = self.library {
            std::mem::forget(library);
        }
        if let Some(claim) = self.claim {
            std::mem::forget(claim);
        }
    }
}

impl std::fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeUnit")
            .field("path", &self.path)
            .field("entry_types", &self.type_names())
            .field("library", &self.library.is_some())
            .finish()
    }
}
