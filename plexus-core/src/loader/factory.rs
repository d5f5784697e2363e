//! FactoryTableLoader - code units resolved from in-process factory tables
//!
//! Used for plugins linked into the host binary and for tests. Tables are
//! registered under the path a descriptor will name; loading that path
//! yields the table without touching the filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use plexus_plugin_api::EntryTypeDecl;

use super::error::CodeUnitError;
use super::{CodeUnit, CodeUnitLoader, LoaderCapabilities};

/// Resolves code-unit paths to registered entry-type tables.
///
/// Each load context sees only the tables it loaded, but the code itself is
/// part of the process and is never reclaimed.
#[derive(Debug, Default)]
pub struct FactoryTableLoader {
    tables: RwLock<HashMap<PathBuf, Vec<EntryTypeDecl>>>,
}

impl FactoryTableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a table under `path`
    pub fn with_table(self, path: impl Into<PathBuf>, entry_types: &[EntryTypeDecl]) -> Self {
        self.register_table(path, entry_types);
        self
    }

    /// Register or replace the table for `path`
    pub fn register_table(&self, path: impl Into<PathBuf>, entry_types: &[EntryTypeDecl]) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), entry_types.to_vec());
    }
}

impl CodeUnitLoader for FactoryTableLoader {
    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            isolation: true,
            reclaim: false,
        }
    }

    fn load(&self, path: &Path) -> Result<CodeUnit, CodeUnitError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let entry_types = tables
            .get(path)
            .ok_or_else(|| CodeUnitError::UnknownFactoryTable {
                path: path.to_path_buf(),
            })?;
        if entry_types.is_empty() {
            return Err(CodeUnitError::EmptyEntryTable);
        }
        Ok(CodeUnit::new(path, entry_types.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plexus_plugin_api::{Plugin, construct};

    #[derive(Default)]
    struct Noop;

    #[async_trait]
    impl Plugin for Noop {}

    const TABLE: &[EntryTypeDecl] = &[EntryTypeDecl {
        name: "Noop",
        create: Some(construct::<Noop>),
    }];

    #[test]
    fn test_resolves_registered_table() {
        let loader = FactoryTableLoader::new().with_table("builtin/noop", TABLE);
        let unit = loader.load(Path::new("builtin/noop")).unwrap();
        assert_eq!(unit.type_names(), vec!["Noop"]);
        assert!(!loader.capabilities().reclaim);
    }

    #[test]
    fn test_unknown_path_is_an_error() {
        let loader = FactoryTableLoader::new();
        assert!(matches!(
            loader.load(Path::new("nowhere")),
            Err(CodeUnitError::UnknownFactoryTable { .. })
        ));
    }

    #[test]
    fn test_empty_table_is_an_error() {
        let loader = FactoryTableLoader::new().with_table("empty", &[]);
        assert!(matches!(
            loader.load(Path::new("empty")),
            Err(CodeUnitError::EmptyEntryTable)
        ));
    }
}
