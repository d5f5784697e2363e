//! LoadContextManager and LoadContext

use std::collections::HashSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use plexus_plugin_api::{EntryTypeDecl, Plugin};

use super::error::{CodeUnitError, LoadContextError};
use super::{CodeUnit, CodeUnitLoader, LoaderCapabilities};
use crate::error::panic_message;

/// Lifecycle of a load context.
///
/// `Unloaded -> Loading -> Loaded -> Unloading -> Released`; a released
/// context cannot be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadContextState {
    /// Created, nothing loaded yet
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    /// Terminal
    Released,
}

impl fmt::Display for LoadContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadContextState::Unloaded => "unloaded",
            LoadContextState::Loading => "loading",
            LoadContextState::Loaded => "loaded",
            LoadContextState::Unloading => "unloading",
            LoadContextState::Released => "released",
        })
    }
}

/// Result of releasing a load context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Whether the context's code was actually reclaimed
    pub unloaded: bool,
    /// Tracked instances still alive at release time
    pub live_instances: usize,
    /// Why reclamation failed, when the loader could reclaim but did not
    pub error: Option<String>,
}

type Names = Arc<Mutex<HashSet<String>>>;

/// Creates load contexts through one loader and keeps their names unique
/// while they are live.
#[derive(Clone)]
pub struct LoadContextManager {
    loader: Arc<dyn CodeUnitLoader>,
    live: Names,
}

impl LoadContextManager {
    pub fn new(loader: Arc<dyn CodeUnitLoader>) -> Self {
        Self {
            loader,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn capabilities(&self) -> LoaderCapabilities {
        self.loader.capabilities()
    }

    /// Allocate a fresh context named `name`.
    ///
    /// Fails if the loader cannot isolate contexts or `name` is still live.
    pub fn create(&self, name: &str) -> Result<LoadContext, LoadContextError> {
        if !self.loader.capabilities().isolation {
            return Err(LoadContextError::ContextCreationFailed {
                name: name.to_string(),
                reason: "loader does not support isolated contexts".to_string(),
            });
        }

        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if !live.insert(name.to_string()) {
            return Err(LoadContextError::ContextCreationFailed {
                name: name.to_string(),
                reason: "name in use".to_string(),
            });
        }
        drop(live);

        tracing::debug!(context = name, "Load context created");
        Ok(LoadContext {
            name: name.to_string(),
            state: LoadContextState::Unloaded,
            loader: Arc::clone(&self.loader),
            units: Vec::new(),
            tracked: Vec::new(),
            live: Arc::clone(&self.live),
        })
    }

    /// Whether a context named `name` exists and has not been released
    pub fn is_live(&self, name: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for LoadContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContextManager")
            .field("capabilities", &self.loader.capabilities())
            .field("live", &self.live_count())
            .finish()
    }
}

type LivenessCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Namespace for one plugin's code units.
///
/// Dropping a context without calling [`release`](Self::release) releases
/// it implicitly.
pub struct LoadContext {
    name: String,
    state: LoadContextState,
    loader: Arc<dyn CodeUnitLoader>,
    units: Vec<CodeUnit>,
    tracked: Vec<LivenessCheck>,
    live: Names,
}

impl LoadContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoadContextState {
        self.state
    }

    /// Code units loaded so far, in load order
    pub fn units(&self) -> &[CodeUnit] {
        &self.units
    }

    /// Load the code unit at `path` into this context
    pub fn load(&mut self, path: &Path) -> Result<&CodeUnit, LoadContextError> {
        if !matches!(
            self.state,
            LoadContextState::Unloaded | LoadContextState::Loaded
        ) {
            return Err(self.invalid_state("load"));
        }

        let previous = self.state;
        self.state = LoadContextState::Loading;
        let loaded = if self.units.iter().any(|u| u.path() == path) {
            Err(CodeUnitError::AlreadyLoaded)
        } else {
            self.loader.load(path)
        };

        match loaded {
            Ok(unit) => {
                self.state = LoadContextState::Loaded;
                self.units.push(unit);
                Ok(&self.units[self.units.len() - 1])
            }
            Err(source) => {
                self.state = previous;
                Err(LoadContextError::LoadFailure {
                    context: self.name.clone(),
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Look up an entry type by name across the loaded units
    pub fn try_get_type(&self, name: &str) -> Option<EntryTypeDecl> {
        self.units.iter().find_map(|unit| unit.find(name))
    }

    /// Construct an instance of `entry`.
    ///
    /// The instance must be dropped before the context is released.
    pub fn create_instance(
        &self,
        entry: &EntryTypeDecl,
    ) -> Result<Box<dyn Plugin>, LoadContextError> {
        if self.state != LoadContextState::Loaded {
            return Err(self.invalid_state("create an instance"));
        }
        let Some(create) = entry.create else {
            return Err(LoadContextError::InstantiationFailure {
                type_name: entry.name.to_string(),
                reason: "no zero-argument constructor".to_string(),
            });
        };

        catch_unwind(AssertUnwindSafe(create)).map_err(|panic| {
            LoadContextError::InstantiationFailure {
                type_name: entry.name.to_string(),
                reason: format!("constructor panicked: {}", panic_message(&*panic)),
            }
        })
    }

    /// Record an instance whose code lives in this context.
    ///
    /// Release will not unmap code while any tracked instance is alive.
    pub fn track<T: ?Sized + Send + Sync + 'static>(&mut self, instance: &Arc<T>) {
        let weak: Weak<T> = Arc::downgrade(instance);
        self.tracked.push(Box::new(move || weak.strong_count() > 0));
    }

    /// Tracked instances that are still alive
    pub fn live_instances(&self) -> usize {
        self.tracked.iter().filter(|alive| alive()).count()
    }

    /// Tear the context down and reclaim its code where possible.
    ///
    /// Never fails; incomplete reclamation is reported as `unloaded == false`.
    pub fn release(mut self) -> ReleaseOutcome {
        self.teardown()
    }

    fn teardown(&mut self) -> ReleaseOutcome {
        if self.state == LoadContextState::Released {
            return ReleaseOutcome {
                unloaded: false,
                live_instances: 0,
                error: None,
            };
        }
        self.state = LoadContextState::Unloading;

        let live_instances = self.live_instances();
        let reclaim = self.loader.capabilities().reclaim;
        let units = std::mem::take(&mut self.units);
        let mut error = None;

        let unloaded = if live_instances > 0 {
            // Unmapping now would leave the live instances pointing at freed code
            for unit in units {
                unit.leak();
            }
            false
        } else {
            let mut all_closed = reclaim;
            for unit in units {
                let path = unit.path().to_path_buf();
                match unit.close() {
                    Ok(closed) => all_closed &= closed || !reclaim,
                    Err(e) => {
                        tracing::warn!(
                            context = %self.name,
                            path = %path.display(),
                            error = %e,
                            "Failed to close code unit"
                        );
                        error.get_or_insert_with(|| e.to_string());
                        all_closed = false;
                    }
                }
            }
            all_closed
        };

        self.tracked.clear();
        self.state = LoadContextState::Released;
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);

        if unloaded {
            tracing::debug!(context = %self.name, "Load context released");
        } else if live_instances > 0 || error.is_some() {
            tracing::warn!(
                context = %self.name,
                live_instances,
                "Load context released without reclaiming code"
            );
        } else {
            tracing::debug!(context = %self.name, reclaim, "Load context released, code stays mapped");
        }
        ReleaseOutcome {
            unloaded,
            live_instances,
            error,
        }
    }

    fn invalid_state(&self, operation: &'static str) -> LoadContextError {
        LoadContextError::InvalidState {
            name: self.name.clone(),
            state: self.state,
            operation,
        }
    }
}

impl Drop for LoadContext {
    fn drop(&mut self) {
        if self.state != LoadContextState::Released {
            self.teardown();
        }
    }
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("units", &self.units)
            .field("tracked", &self.tracked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::FactoryTableLoader;
    use async_trait::async_trait;
    use plexus_plugin_api::construct;

    #[derive(Default)]
    struct Counter;

    #[async_trait]
    impl Plugin for Counter {}

    struct Exploding;

    #[async_trait]
    impl Plugin for Exploding {}

    fn explode() -> Box<dyn Plugin> {
        panic!("constructor failed")
    }

    const TABLE: &[EntryTypeDecl] = &[
        EntryTypeDecl {
            name: "Counter",
            create: Some(construct::<Counter>),
        },
        EntryTypeDecl {
            name: "Exploding",
            create: Some(explode),
        },
        EntryTypeDecl {
            name: "NeedsArgs",
            create: None,
        },
    ];

    fn manager() -> LoadContextManager {
        let loader = FactoryTableLoader::new()
            .with_table("units/counter", TABLE)
            .with_table("units/extra", &TABLE[..1]);
        LoadContextManager::new(Arc::new(loader))
    }

    struct Shared;

    impl CodeUnitLoader for Shared {
        fn capabilities(&self) -> LoaderCapabilities {
            LoaderCapabilities {
                isolation: false,
                reclaim: false,
            }
        }

        fn load(&self, _path: &Path) -> Result<CodeUnit, CodeUnitError> {
            Err(CodeUnitError::EmptyEntryTable)
        }
    }

    #[test]
    fn test_load_and_instantiate() {
        let manager = manager();
        let mut ctx = manager.create("demo").unwrap();
        assert_eq!(ctx.state(), LoadContextState::Unloaded);

        let unit = ctx.load(Path::new("units/counter")).unwrap();
        assert_eq!(unit.type_names(), vec!["Counter", "Exploding", "NeedsArgs"]);
        assert_eq!(ctx.state(), LoadContextState::Loaded);

        let entry = ctx.try_get_type("Counter").unwrap();
        assert!(ctx.create_instance(&entry).is_ok());
        assert!(ctx.try_get_type("Missing").is_none());
    }

    #[test]
    fn test_names_are_unique_while_live() {
        let manager = manager();
        let ctx = manager.create("demo").unwrap();
        assert!(matches!(
            manager.create("demo"),
            Err(LoadContextError::ContextCreationFailed { .. })
        ));

        let outcome = ctx.release();
        // Factory tables are never reclaimed
        assert!(!outcome.unloaded);
        assert!(!manager.is_live("demo"));
        assert!(manager.create("demo").is_ok());
    }

    #[test]
    fn test_dropping_a_context_frees_its_name() {
        let manager = manager();
        drop(manager.create("demo").unwrap());
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn test_loader_without_isolation_cannot_create() {
        let manager = LoadContextManager::new(Arc::new(Shared));
        let err = manager.create("demo").unwrap_err();
        assert!(err.to_string().contains("isolated"));
    }

    #[test]
    fn test_loading_same_unit_twice_fails() {
        let manager = manager();
        let mut ctx = manager.create("demo").unwrap();
        ctx.load(Path::new("units/counter")).unwrap();

        let err = ctx.load(Path::new("units/counter")).unwrap_err();
        assert!(matches!(
            err,
            LoadContextError::LoadFailure {
                source: CodeUnitError::AlreadyLoaded,
                ..
            }
        ));
        // Failure does not disturb what is already loaded
        assert_eq!(ctx.state(), LoadContextState::Loaded);
        assert!(ctx.load(Path::new("units/extra")).is_ok());
        assert_eq!(ctx.units().len(), 2);
    }

    #[test]
    fn test_missing_unit_is_load_failure() {
        let manager = manager();
        let mut ctx = manager.create("demo").unwrap();
        assert!(matches!(
            ctx.load(Path::new("units/missing")),
            Err(LoadContextError::LoadFailure { .. })
        ));
        assert_eq!(ctx.state(), LoadContextState::Unloaded);
    }

    #[test]
    fn test_instantiation_failures() {
        let manager = manager();
        let mut ctx = manager.create("demo").unwrap();
        ctx.load(Path::new("units/counter")).unwrap();

        let needs_args = ctx.try_get_type("NeedsArgs").unwrap();
        assert!(matches!(
            ctx.create_instance(&needs_args),
            Err(LoadContextError::InstantiationFailure { .. })
        ));

        let exploding = ctx.try_get_type("Exploding").unwrap();
        let Err(err) = ctx.create_instance(&exploding) else {
            panic!("expected instantiation failure");
        };
        assert!(err.to_string().contains("constructor failed"));
    }

    #[test]
    fn test_create_instance_requires_loaded_state() {
        let manager = manager();
        let ctx = manager.create("demo").unwrap();
        let entry = TABLE[0];
        assert!(matches!(
            ctx.create_instance(&entry),
            Err(LoadContextError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_release_reports_live_instances() {
        let manager = manager();
        let mut ctx = manager.create("demo").unwrap();
        ctx.load(Path::new("units/counter")).unwrap();
        let entry = ctx.try_get_type("Counter").unwrap();
        let instance: Arc<dyn Plugin> = Arc::from(ctx.create_instance(&entry).unwrap());
        ctx.track(&instance);
        assert_eq!(ctx.live_instances(), 1);

        let outcome = ctx.release();
        assert!(!outcome.unloaded);
        assert_eq!(outcome.live_instances, 1);
        drop(instance);
    }

    #[test]
    fn test_dropped_instances_are_not_counted() {
        let manager = manager();
        let mut ctx = manager.create("demo").unwrap();
        ctx.load(Path::new("units/counter")).unwrap();
        let entry = ctx.try_get_type("Counter").unwrap();
        let instance: Arc<dyn Plugin> = Arc::from(ctx.create_instance(&entry).unwrap());
        ctx.track(&instance);
        drop(instance);

        let outcome = ctx.release();
        assert_eq!(outcome.live_instances, 0);
        assert!(outcome.error.is_none());
    }
}
