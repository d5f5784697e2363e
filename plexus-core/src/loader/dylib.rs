//! DylibLoader - code units are shared libraries built with `export_plugin!`

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use libloading::{Library, Symbol};
use plexus_plugin_api::{API_VERSION, API_VERSION_SYMBOL, ENTRY_TABLE_SYMBOL, EntryTypeDecl};

use super::error::CodeUnitError;
use super::{CodeUnit, CodeUnitLoader, LoaderCapabilities};

type OpenPaths = Arc<Mutex<HashSet<PathBuf>>>;

/// Loads shared libraries with `libloading`.
///
/// The dynamic linker hands out one shared mapping per library file, so a
/// library path can back only one live code unit at a time; a second load
/// of the same canonical path fails with [`CodeUnitError::PathInUse`] until
/// the first unit is closed. Libraries are closed on release, so code can be
/// reclaimed once nothing created from it is alive.
#[derive(Debug, Clone, Default)]
pub struct DylibLoader {
    open: OpenPaths,
}

impl DylibLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `path` for one code unit
    fn claim(&self, path: &Path) -> Result<PathClaim, CodeUnitError> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !open.insert(path.clone()) {
            return Err(CodeUnitError::PathInUse { path });
        }
        Ok(PathClaim {
            path,
            open: Arc::clone(&self.open),
        })
    }
}

/// A library path reserved by one code unit; dropping it frees the path
pub(super) struct PathClaim {
    path: PathBuf,
    open: OpenPaths,
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

impl CodeUnitLoader for DylibLoader {
    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            isolation: true,
            reclaim: true,
        }
    }

    fn load(&self, path: &Path) -> Result<CodeUnit, CodeUnitError> {
        let claim = self.claim(path)?;

        // SAFETY: loading a library runs its initializers. Code units are
        // supplied by the application, which vouches for them.
        let library = unsafe { Library::new(path)? };

        // SAFETY: the symbol is generated by `export_plugin!` with this signature.
        let api_version: Symbol<extern "C" fn() -> u32> =
            unsafe { library.get(API_VERSION_SYMBOL)? };
        let found = api_version();
        if found != API_VERSION {
            return Err(CodeUnitError::ApiVersionMismatch {
                expected: API_VERSION,
                found,
            });
        }

        // SAFETY: same as above. The table and the constructors it points
        // to stay valid while `library` is open, and `CodeUnit` keeps it open.
        let entry_types: Vec<EntryTypeDecl> = unsafe {
            let table: Symbol<fn() -> &'static [EntryTypeDecl]> =
                library.get(ENTRY_TABLE_SYMBOL)?;
            table().to_vec()
        };
        if entry_types.is_empty() {
            return Err(CodeUnitError::EmptyEntryTable);
        }

        tracing::debug!(
            path = %path.display(),
            entry_types = entry_types.len(),
            "Loaded code unit"
        );
        Ok(CodeUnit::new(path, entry_types)
            .with_library(library)
            .with_claim(claim))
    }
}
