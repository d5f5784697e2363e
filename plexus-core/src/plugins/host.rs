//! PluginHost - drives each plugin through its lifecycle

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use plexus_plugin_api::{
    Contract, Plugin, PluginConfig, PluginContext, PluginDescriptor, PluginError, RunFuture,
    ServiceAccessor, ServiceMap, SleepFuture, Timer, UnloadVerdict,
};
use semver::{Version, VersionReq};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::{LoadCause, PluginHostError};
use crate::error::panic_message;
use crate::events::{DEFAULT_EVENT_CAPACITY, PluginEvent};
use crate::loader::{CodeUnitLoader, LoadContext, LoadContextManager, ReleaseOutcome};
use crate::providers::{ProviderRegistry, Registration};

/// Lifecycle state of a plugin id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    NotLoaded,
    /// Instantiated and configured
    Loaded,
    /// Run hook started
    Active,
    /// Deactivated, waiting to be unloaded
    Inactive,
    Unloaded,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PluginState::NotLoaded => "not loaded",
            PluginState::Loaded => "loaded",
            PluginState::Active => "active",
            PluginState::Inactive => "inactive",
            PluginState::Unloaded => "unloaded",
        })
    }
}

/// Snapshot of a plugin the host is managing
#[derive(Debug, Clone)]
pub struct PluginHandle {
    pub id: String,
    pub descriptor: PluginDescriptor,
    pub state: PluginState,
}

/// Configuration for PluginHost
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    /// How long deactivation waits for a run hook before aborting it
    pub run_stop_timeout: Duration,
    /// Contract versions the host accepts
    pub contract_version: VersionReq,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
    /// Base data directory for plugins whose descriptor lists no code unit directory
    pub plugin_dir: PathBuf,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        let plugin_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plexus")
            .join("plugins");

        Self {
            run_stop_timeout: Duration::from_secs(5),
            contract_version: VersionReq::STAR,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            plugin_dir,
        }
    }
}

struct RunTask {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// A loaded plugin with its runtime state.
///
/// `instance` is declared before `context` so it is dropped first.
struct LoadedPlugin {
    instance: Arc<dyn Plugin>,
    context: LoadContext,
    run: Option<RunTask>,
}

/// Per-id record. Its mutex serializes transitions of one plugin.
struct PluginSlot {
    handle: PluginHandle,
    loaded: Option<LoadedPlugin>,
}

/// The plugin host drives plugins through
/// `NotLoaded -> Loaded -> Active -> Inactive -> Unloaded`.
///
/// Transitions of different plugins run concurrently; transitions of the
/// same plugin wait for each other. A failed transition leaves the plugin
/// in its last good state and is reported both to the caller and as a
/// [`PluginEvent::Failed`].
pub struct PluginHost {
    config: PluginHostConfig,
    contexts: LoadContextManager,
    registry: Arc<ProviderRegistry>,
    services: Arc<dyn ServiceAccessor>,
    plugins: RwLock<HashMap<String, Arc<Mutex<PluginSlot>>>>,
    shutdown: CancellationToken,
    events: broadcast::Sender<PluginEvent>,
}

impl PluginHost {
    /// Create a host loading code through `loader`.
    ///
    /// Provider registrations made through the host go to `registry` and
    /// are retracted when their plugin is deactivated.
    pub fn new(
        config: PluginHostConfig,
        loader: Arc<dyn CodeUnitLoader>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            contexts: LoadContextManager::new(loader),
            registry,
            services: Arc::new(ServiceMap::new()),
            plugins: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            events,
        }
    }

    /// Builder: services handed to plugins while they configure
    pub fn with_services(mut self, services: Arc<dyn ServiceAccessor>) -> Self {
        self.services = services;
        self
    }

    pub fn config(&self) -> &PluginHostConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The host shutdown signal every run hook is derived from
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    // ===== Transitions =====

    /// Load, instantiate and configure the plugin `descriptor` describes.
    ///
    /// On failure the partially created load context is released before
    /// returning, so the same id can be loaded again.
    pub async fn load_plugin(
        &self,
        descriptor: PluginDescriptor,
    ) -> Result<PluginHandle, PluginHostError> {
        let id = descriptor.id.clone();
        let slot = self.reserve(&descriptor);
        let mut slot = slot.lock().await;

        let from = slot.handle.state;
        if !matches!(from, PluginState::NotLoaded | PluginState::Unloaded) {
            return Err(self.invalid_transition(&id, from, "load"));
        }

        let loaded = match self.instantiate(&descriptor).await {
            Ok(loaded) => loaded,
            Err(cause) => {
                let error = PluginHostError::PluginLoadFailed {
                    id: id.clone(),
                    source: Arc::new(cause),
                };
                return Err(self.fail(&id, "load", error));
            }
        };

        slot.handle = PluginHandle {
            id: id.clone(),
            descriptor: descriptor.clone(),
            state: PluginState::Loaded,
        };
        slot.loaded = Some(loaded);

        tracing::info!(
            plugin = %id,
            version = %descriptor.version,
            entry_type = %descriptor.entry_type_name,
            "Plugin loaded"
        );
        self.emit(PluginEvent::Loaded { id, descriptor });
        Ok(slot.handle.clone())
    }

    /// Start the plugin's run hook, if it has one. Valid only from `Loaded`.
    pub async fn activate(&self, id: &str) -> Result<(), PluginHostError> {
        let slot = self.slot_for(id, "activate")?;
        let mut guard = slot.lock().await;
        let PluginSlot { handle, loaded } = &mut *guard;

        let from = handle.state;
        let Some(plugin) = loaded.as_mut().filter(|_| from == PluginState::Loaded) else {
            return Err(self.invalid_transition(id, from, "activate"));
        };

        let token = self.shutdown.child_token();
        let instance = Arc::clone(&plugin.instance);
        let run = match catch_unwind(AssertUnwindSafe(|| instance.run(token.clone()))) {
            Ok(run) => run,
            Err(panic) => {
                let error = PluginHostError::HookFailed {
                    id: id.to_string(),
                    hook: "run",
                    reason: format!("panicked: {}", panic_message(&*panic)),
                };
                return Err(self.fail(id, "activate", error));
            }
        };

        if let Some(future) = run {
            let task = tokio::spawn(supervise_run(id.to_string(), future, self.events.clone()));
            plugin.run = Some(RunTask { token, task });
        }

        handle.state = PluginState::Active;
        tracing::info!(plugin = %id, "Plugin activated");
        self.emit(PluginEvent::Activated { id: id.to_string() });
        Ok(())
    }

    /// Ask the plugin for permission, prepare it, stop its run hook and
    /// retract its provider registrations.
    ///
    /// Valid from `Active` or `Loaded`. A refusal leaves the plugin where it
    /// was and returns [`PluginHostError::UnloadRefused`].
    pub async fn deactivate(&self, id: &str) -> Result<(), PluginHostError> {
        let slot = self.slot_for(id, "deactivate")?;
        let mut guard = slot.lock().await;
        let PluginSlot { handle, loaded } = &mut *guard;

        let from = handle.state;
        let Some(plugin) = loaded
            .as_mut()
            .filter(|_| matches!(from, PluginState::Active | PluginState::Loaded))
        else {
            return Err(self.invalid_transition(id, from, "deactivate"));
        };

        match AssertUnwindSafe(plugin.instance.can_unload())
            .catch_unwind()
            .await
        {
            Ok(UnloadVerdict::Allow) => {}
            Ok(UnloadVerdict::Refuse { reason }) => {
                let error = PluginHostError::UnloadRefused {
                    id: id.to_string(),
                    reason,
                };
                return Err(self.fail(id, "deactivate", error));
            }
            Err(panic) => {
                let error = hook_panicked(id, "can_unload", &*panic);
                return Err(self.fail(id, "deactivate", error));
            }
        }

        let prepared = AssertUnwindSafe(plugin.instance.prepare_unload())
            .catch_unwind()
            .await;
        let error = match prepared {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(PluginHostError::HookFailed {
                id: id.to_string(),
                hook: "prepare_unload",
                reason: e.to_string(),
            }),
            Err(panic) => Some(hook_panicked(id, "prepare_unload", &*panic)),
        };
        if let Some(error) = error {
            return Err(self.fail(id, "deactivate", error));
        }

        self.stop_run(id, plugin).await;
        self.registry.retract_owner(id);

        handle.state = PluginState::Inactive;
        tracing::info!(plugin = %id, "Plugin deactivated");
        self.emit(PluginEvent::Deactivated { id: id.to_string() });
        Ok(())
    }

    /// Release the plugin's load context. Valid only from `Inactive`.
    ///
    /// The returned outcome says whether code was actually reclaimed; the
    /// plugin is discarded either way.
    pub async fn unload(&self, id: &str) -> Result<ReleaseOutcome, PluginHostError> {
        let slot = self.slot_for(id, "unload")?;
        let mut slot = slot.lock().await;

        let from = slot.handle.state;
        if from != PluginState::Inactive {
            return Err(self.invalid_transition(id, from, "unload"));
        }
        Ok(self.discard(id, &mut slot).await)
    }

    /// Unload from any loaded state without asking the plugin.
    ///
    /// The run hook is stopped and registrations retracted as in
    /// [`deactivate`](Self::deactivate), but `can_unload` and
    /// `prepare_unload` are skipped.
    pub async fn force_unload(&self, id: &str) -> Result<ReleaseOutcome, PluginHostError> {
        let slot = self.slot_for(id, "force unload")?;
        let mut slot = slot.lock().await;

        let from = slot.handle.state;
        if !matches!(
            from,
            PluginState::Loaded | PluginState::Active | PluginState::Inactive
        ) {
            return Err(self.invalid_transition(id, from, "force unload"));
        }
        tracing::warn!(plugin = %id, state = %from, "Force unloading plugin");
        Ok(self.discard(id, &mut slot).await)
    }

    /// Cancel the shutdown signal and force-unload every plugin.
    ///
    /// Returns the release outcome of each plugin that was unloaded.
    pub async fn shutdown(&self) -> Vec<(String, ReleaseOutcome)> {
        self.shutdown.cancel();

        let mut outcomes = Vec::new();
        for handle in self.list().await {
            match self.force_unload(&handle.id).await {
                Ok(outcome) => outcomes.push((handle.id, outcome)),
                // Raced with a caller-initiated unload
                Err(e) => tracing::debug!(plugin = %handle.id, error = %e, "Skipped during shutdown"),
            }
        }
        tracing::info!(unloaded = outcomes.len(), "Plugin host shut down");
        outcomes
    }

    // ===== Providers =====

    /// The plugin's implementation of contract `C`.
    ///
    /// The returned provider is tracked by the plugin's load context, so
    /// holding on to it past unload shows up as a live instance.
    pub async fn provider<C: Contract + ?Sized>(&self, id: &str) -> Result<Arc<C>, PluginHostError> {
        let slot = self.slot_for_provider(id)?;
        let mut slot = slot.lock().await;
        self.provide_from::<C>(id, &mut slot)
    }

    /// Register the plugin's implementation of `C` under the capabilities
    /// its descriptor declares.
    ///
    /// An empty `provider_id` in the descriptor defaults to the plugin id.
    /// Valid while the plugin is `Loaded` or `Active`.
    pub async fn register_provider<C: Contract + ?Sized>(
        &self,
        id: &str,
    ) -> Result<Registration<C>, PluginHostError> {
        let slot = self.slot_for_provider(id)?;
        let mut slot = slot.lock().await;

        let from = slot.handle.state;
        if !matches!(from, PluginState::Loaded | PluginState::Active) {
            return Err(self.invalid_transition(id, from, "register provider"));
        }

        let provider = self.provide_from::<C>(id, &mut slot)?;
        let mut capabilities = slot.handle.descriptor.capabilities.clone();
        if capabilities.provider_id.is_empty() {
            capabilities.provider_id = id.to_string();
        }

        self.registry
            .register_owned(id, provider, capabilities)
            .map_err(|e| {
                let error = PluginHostError::ProviderRegistration {
                    id: id.to_string(),
                    source: Arc::new(e),
                };
                self.fail(id, "register provider", error)
            })
    }

    // ===== Queries =====

    /// Handle of a loaded plugin; `None` once it is unloaded
    pub async fn handle(&self, id: &str) -> Option<PluginHandle> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        slot.loaded.as_ref().map(|_| slot.handle.clone())
    }

    /// Handles of every loaded plugin, sorted by id
    pub async fn list(&self) -> Vec<PluginHandle> {
        let slots: Vec<Arc<Mutex<PluginSlot>>> = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = slot.lock().await;
            if slot.loaded.is_some() {
                handles.push(slot.handle.clone());
            }
        }
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Current state of `id`; `NotLoaded` for ids the host has never seen
    pub async fn state(&self, id: &str) -> PluginState {
        match self.slot(id) {
            Some(slot) => slot.lock().await.handle.state,
            None => PluginState::NotLoaded,
        }
    }

    // ===== Internals =====

    async fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<LoadedPlugin, LoadCause> {
        self.check_contract_version(descriptor)?;
        if descriptor.code_unit_paths.is_empty() {
            return Err(LoadCause::NoCodeUnits);
        }

        // Locals drop in reverse order, so on any early return the instance
        // goes before the context, and the context releases itself.
        let mut context = self.contexts.create(&descriptor.id)?;
        for path in &descriptor.code_unit_paths {
            context.load(path)?;
        }
        let entry = context
            .try_get_type(&descriptor.entry_type_name)
            .ok_or_else(|| LoadCause::EntryTypeNotFound(descriptor.entry_type_name.clone()))?;
        let mut instance = context.create_instance(&entry)?;

        let plugin_dir = descriptor
            .plugin_dir()
            .unwrap_or_else(|| self.config.plugin_dir.join(&descriptor.id));
        let config_path = plugin_dir.join("config.toml");
        let mut ctx = PluginContext::new(descriptor.id.clone(), plugin_dir)
            .with_config(PluginConfig::load(&config_path)?)
            .with_services(Arc::clone(&self.services))
            .with_timer(Arc::new(RuntimeTimer))
            .with_shutdown(self.shutdown.child_token());

        match AssertUnwindSafe(instance.configure(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(LoadCause::Configure(e)),
            Err(panic) => return Err(LoadCause::ConfigurePanicked(panic_message(&*panic))),
        }
        if ctx.config_mut().is_dirty() {
            ctx.config_mut().save(&config_path)?;
        }

        let instance: Arc<dyn Plugin> = Arc::from(instance);
        context.track(&instance);
        Ok(LoadedPlugin {
            instance,
            context,
            run: None,
        })
    }

    fn check_contract_version(&self, descriptor: &PluginDescriptor) -> Result<(), LoadCause> {
        let found = Version::parse(&descriptor.contract_version)
            .map_err(|_| LoadCause::InvalidContractVersion(descriptor.contract_version.clone()))?;
        if !self.config.contract_version.matches(&found) {
            return Err(LoadCause::IncompatibleContract {
                found: found.to_string(),
                required: self.config.contract_version.to_string(),
            });
        }
        Ok(())
    }

    fn provide_from<C: Contract + ?Sized>(
        &self,
        id: &str,
        slot: &mut PluginSlot,
    ) -> Result<Arc<C>, PluginHostError> {
        let Some(plugin) = slot.loaded.as_mut() else {
            return Err(self.fail(id, "provide", PluginHostError::NotFound { id: id.to_string() }));
        };

        let instance = &plugin.instance;
        let provided = catch_unwind(AssertUnwindSafe(|| instance.provide(C::CATEGORY)))
            .map_err(|panic| self.fail(id, "provide", hook_panicked(id, "provide", &*panic)))?;

        let Some(provider) = provided
            .and_then(|any| any.downcast::<Arc<C>>().ok())
            .map(|provider| Arc::clone(&*provider))
        else {
            let error = PluginHostError::ContractMismatch {
                id: id.to_string(),
                category: C::CATEGORY,
            };
            return Err(self.fail(id, "provide", error));
        };

        plugin.context.track(&provider);
        Ok(provider)
    }

    /// Stop the run hook: cancel, wait up to the stop timeout, then abort
    async fn stop_run(&self, id: &str, plugin: &mut LoadedPlugin) {
        let Some(RunTask { token, mut task }) = plugin.run.take() else {
            return;
        };
        token.cancel();

        let timeout = self.config.run_stop_timeout;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            tracing::warn!(plugin = %id, ?timeout, "Run hook did not stop in time, aborting");
            task.abort();
            // Wait for the aborted future to be dropped
            let _ = task.await;
        } else {
            tracing::debug!(plugin = %id, "Run hook stopped");
        }
    }

    /// Stop, retract and release; always leaves the slot `Unloaded`
    async fn discard(&self, id: &str, slot: &mut PluginSlot) -> ReleaseOutcome {
        let outcome = match slot.loaded.take() {
            Some(mut plugin) => {
                self.stop_run(id, &mut plugin).await;
                self.registry.retract_owner(id);
                let LoadedPlugin {
                    instance, context, ..
                } = plugin;
                drop(instance);
                context.release()
            }
            None => ReleaseOutcome {
                unloaded: false,
                live_instances: 0,
                error: None,
            },
        };
        slot.handle.state = PluginState::Unloaded;

        tracing::info!(
            plugin = %id,
            unloaded = outcome.unloaded,
            live_instances = outcome.live_instances,
            "Plugin unloaded"
        );
        self.emit(PluginEvent::Unloaded {
            id: id.to_string(),
            descriptor: slot.handle.descriptor.clone(),
            unloaded: outcome.unloaded,
        });
        outcome
    }

    fn slot(&self, id: &str) -> Option<Arc<Mutex<PluginSlot>>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Slot for a transition; an unknown id is reported as `NotLoaded`
    fn slot_for(
        &self,
        id: &str,
        operation: &'static str,
    ) -> Result<Arc<Mutex<PluginSlot>>, PluginHostError> {
        self.slot(id)
            .ok_or_else(|| self.invalid_transition(id, PluginState::NotLoaded, operation))
    }

    fn slot_for_provider(&self, id: &str) -> Result<Arc<Mutex<PluginSlot>>, PluginHostError> {
        self.slot(id).ok_or_else(|| {
            self.fail(id, "provide", PluginHostError::NotFound { id: id.to_string() })
        })
    }

    fn reserve(&self, descriptor: &PluginDescriptor) -> Arc<Mutex<PluginSlot>> {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        let slot = plugins.entry(descriptor.id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(PluginSlot {
                handle: PluginHandle {
                    id: descriptor.id.clone(),
                    descriptor: descriptor.clone(),
                    state: PluginState::NotLoaded,
                },
                loaded: None,
            }))
        });
        Arc::clone(slot)
    }

    fn invalid_transition(
        &self,
        id: &str,
        from: PluginState,
        operation: &'static str,
    ) -> PluginHostError {
        let error = PluginHostError::InvalidStateTransition {
            id: id.to_string(),
            from,
            operation,
        };
        self.fail(id, operation, error)
    }

    fn fail(&self, id: &str, operation: &'static str, error: PluginHostError) -> PluginHostError {
        report_failure(&self.events, id, operation, &error);
        error
    }

    fn emit(&self, event: PluginEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("config", &self.config)
            .field("contexts", &self.contexts)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Timer handed to plugins, backed by the host's runtime
struct RuntimeTimer;

impl Timer for RuntimeTimer {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

async fn supervise_run(id: String, run: RunFuture, events: broadcast::Sender<PluginEvent>) {
    let reason = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(())) | Ok(Err(PluginError::Cancelled)) => {
            tracing::debug!(plugin = %id, "Run hook finished");
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("panicked: {}", panic_message(&*panic)),
    };
    let error = PluginHostError::HookFailed {
        id: id.clone(),
        hook: "run",
        reason,
    };
    report_failure(&events, &id, "run", &error);
}

fn hook_panicked(
    id: &str,
    hook: &'static str,
    panic: &(dyn std::any::Any + Send),
) -> PluginHostError {
    PluginHostError::HookFailed {
        id: id.to_string(),
        hook,
        reason: format!("panicked: {}", panic_message(panic)),
    }
}

fn report_failure(
    events: &broadcast::Sender<PluginEvent>,
    id: &str,
    operation: &'static str,
    error: &PluginHostError,
) {
    match error {
        PluginHostError::UnloadRefused { .. } => {
            tracing::warn!(plugin = %id, operation, error = %error, "Plugin refused transition")
        }
        _ => tracing::error!(plugin = %id, operation, error = %error, "Plugin operation failed"),
    }
    let _ = events.send(PluginEvent::Failed {
        id: id.to_string(),
        operation,
        error: Arc::new(error.clone()),
    });
}
