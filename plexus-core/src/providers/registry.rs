//! ProviderRegistry - contract type -> ordered set of provider registrations
//!
//! Each contract owns an [`ArcSwap`] holding its published registration set.
//! Readers load the current `Arc` without locking; writers for the same
//! contract serialize on a small mutex, build a new set, and publish it with
//! a single atomic store. A reader therefore never observes a half-applied
//! register or unregister.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwap;
use plexus_plugin_api::{CapabilityDescriptor, Contract};
use tokio::sync::broadcast;

use super::accessor::Providers;
use crate::error::RegistryError;
use crate::events::{DEFAULT_EVENT_CAPACITY, RegistryEvent};

/// Identity of a contract type
#[derive(Clone, Copy)]
pub struct ContractId {
    type_id: TypeId,
    type_name: &'static str,
    category: &'static str,
}

impl ContractId {
    /// Id of contract `C`
    pub fn of<C: Contract + ?Sized>() -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            type_name: type_name::<C>(),
            category: C::CATEGORY,
        }
    }

    /// Routing-configuration key of the contract
    pub fn category(&self) -> &'static str {
        self.category
    }

    /// Rust type name of the contract, for diagnostics
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for ContractId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ContractId {}

impl Hash for ContractId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId({})", self.type_name)
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category)
    }
}

/// Registry-unique id of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

/// A provider registered for contract `C`, with its capabilities
pub struct Registration<C: ?Sized> {
    id: RegistrationId,
    contract: ContractId,
    provider: Arc<C>,
    capabilities: Arc<CapabilityDescriptor>,
    owner: Option<Arc<str>>,
    active: bool,
}

impl<C: ?Sized> Registration<C> {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn contract(&self) -> ContractId {
        self.contract
    }

    pub fn provider(&self) -> &Arc<C> {
        &self.provider
    }

    pub fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    /// Shorthand for `capabilities().provider_id`
    pub fn provider_id(&self) -> &str {
        &self.capabilities.provider_id
    }

    /// Plugin id that supplied the provider, if it came from a plugin
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl<C: ?Sized> Clone for Registration<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            contract: self.contract,
            provider: Arc::clone(&self.provider),
            capabilities: Arc::clone(&self.capabilities),
            owner: self.owner.clone(),
            active: self.active,
        }
    }
}

impl<C: ?Sized> fmt::Debug for Registration<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("contract", &self.contract)
            .field("provider_id", &self.capabilities.provider_id)
            .field("owner", &self.owner)
            .field("active", &self.active)
            .finish()
    }
}

/// Point-in-time copy of the active registrations of one contract.
///
/// Never changes after it is taken; registry writes publish a new
/// generation instead.
pub struct RegistrationSnapshot<C: ?Sized> {
    contract: ContractId,
    generation: u64,
    registrations: Vec<Registration<C>>,
}

impl<C: ?Sized> RegistrationSnapshot<C> {
    pub fn contract(&self) -> ContractId {
        self.contract
    }

    /// Strictly increases with every publish for this contract
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Active registrations in insertion order
    pub fn registrations(&self) -> &[Registration<C>] {
        &self.registrations
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }
}

impl<C: ?Sized> Clone for RegistrationSnapshot<C> {
    fn clone(&self) -> Self {
        Self {
            contract: self.contract,
            generation: self.generation,
            registrations: self.registrations.clone(),
        }
    }
}

// ===== Per-contract storage =====

/// Published set, including inactive registrations
struct Published<C: ?Sized> {
    generation: u64,
    registrations: Vec<Registration<C>>,
}

struct ContractEntry<C: ?Sized> {
    contract: ContractId,
    published: ArcSwap<Published<C>>,
    write: Mutex<()>,
}

impl<C: ?Sized + Send + Sync + 'static> ContractEntry<C> {
    fn new(contract: ContractId) -> Self {
        Self {
            contract,
            published: ArcSwap::from_pointee(Published {
                generation: 0,
                registrations: Vec::new(),
            }),
            write: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> RegistrationSnapshot<C> {
        let published = self.published.load();
        RegistrationSnapshot {
            contract: self.contract,
            generation: published.generation,
            registrations: published
                .registrations
                .iter()
                .filter(|r| r.active)
                .cloned()
                .collect(),
        }
    }

    /// Apply `edit` to a copy of the current set and publish it.
    ///
    /// Returns `None` (and publishes nothing) when `edit` returns `None`.
    fn update<T>(
        &self,
        generations: &AtomicU64,
        edit: impl FnOnce(&mut Vec<Registration<C>>) -> Option<T>,
    ) -> Option<T> {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.published.load().registrations.clone();
        let out = edit(&mut next)?;
        self.published.store(Arc::new(Published {
            generation: generations.fetch_add(1, Ordering::SeqCst) + 1,
            registrations: next,
        }));
        Some(out)
    }
}

/// Type-erased view of a [`ContractEntry`] for operations that span contracts
trait ContractSlot: Send + Sync {
    fn contract(&self) -> ContractId;
    fn active_len(&self) -> usize;
    fn retract_owner(&self, owner: &str, generations: &AtomicU64) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<C: ?Sized + Send + Sync + 'static> ContractSlot for ContractEntry<C> {
    fn contract(&self) -> ContractId {
        self.contract
    }

    fn active_len(&self) -> usize {
        self.published
            .load()
            .registrations
            .iter()
            .filter(|r| r.active)
            .count()
    }

    fn retract_owner(&self, owner: &str, generations: &AtomicU64) -> usize {
        self.update(generations, |regs| {
            let before = regs.len();
            regs.retain(|r| r.owner.as_deref() != Some(owner));
            let removed = before - regs.len();
            (removed > 0).then_some(removed)
        })
        .unwrap_or(0)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ===== Registry =====

/// Registry of providers for any number of contracts.
///
/// Holds references to providers only; it never loads or unloads code.
pub struct ProviderRegistry {
    contracts: RwLock<HashMap<TypeId, Arc<dyn ContractSlot>>>,
    next_id: AtomicU64,
    generations: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty registry with the given change-notification capacity
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            contracts: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            generations: AtomicU64::new(0),
            events,
        }
    }

    /// Register `provider` for contract `C`.
    ///
    /// Fails if `capabilities.provider_id` is already registered for `C`.
    pub fn register<C: Contract + ?Sized>(
        &self,
        provider: Arc<C>,
        capabilities: CapabilityDescriptor,
    ) -> Result<Registration<C>, RegistryError> {
        self.insert(provider, capabilities, None)
    }

    /// Register a provider supplied by plugin `owner`.
    ///
    /// [`retract_owner`](Self::retract_owner) removes every registration
    /// made this way for that plugin.
    pub fn register_owned<C: Contract + ?Sized>(
        &self,
        owner: &str,
        provider: Arc<C>,
        capabilities: CapabilityDescriptor,
    ) -> Result<Registration<C>, RegistryError> {
        self.insert(provider, capabilities, Some(Arc::from(owner)))
    }

    fn insert<C: Contract + ?Sized>(
        &self,
        provider: Arc<C>,
        capabilities: CapabilityDescriptor,
        owner: Option<Arc<str>>,
    ) -> Result<Registration<C>, RegistryError> {
        let entry = self.entry::<C>();
        let registration = Registration {
            id: RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            contract: entry.contract,
            provider,
            capabilities: Arc::new(capabilities),
            owner,
            active: true,
        };

        let published = entry.update(&self.generations, |regs| {
            if regs
                .iter()
                .any(|r| r.provider_id() == registration.provider_id())
            {
                return None;
            }
            regs.push(registration.clone());
            Some(())
        });

        if published.is_none() {
            return Err(RegistryError::DuplicateProviderId {
                contract: entry.contract,
                provider_id: registration.provider_id().to_string(),
            });
        }

        tracing::debug!(
            contract = %entry.contract,
            provider = %registration.provider_id(),
            owner = ?registration.owner(),
            "Provider registered"
        );
        self.notify(entry.contract);
        Ok(registration)
    }

    /// Remove a registration.
    ///
    /// Returns `false` (not an error) if it was already removed.
    pub fn unregister<C: Contract + ?Sized>(&self, registration: &Registration<C>) -> bool {
        let Some(entry) = self.lookup::<C>() else {
            return false;
        };

        let removed = entry
            .update(&self.generations, |regs| {
                let index = regs.iter().position(|r| r.id == registration.id)?;
                regs.remove(index);
                Some(())
            })
            .is_some();

        if removed {
            tracing::debug!(
                contract = %entry.contract,
                provider = %registration.provider_id(),
                "Provider unregistered"
            );
            self.notify(entry.contract);
        }
        removed
    }

    /// Republish a registration with a different `active` flag.
    ///
    /// Returns the updated registration, or `None` if it is no longer
    /// registered. Inactive registrations are invisible to readers.
    pub fn set_active<C: Contract + ?Sized>(
        &self,
        registration: &Registration<C>,
        active: bool,
    ) -> Option<Registration<C>> {
        let entry = self.lookup::<C>()?;
        let current = entry
            .published
            .load()
            .registrations
            .iter()
            .find(|r| r.id == registration.id)
            .cloned()?;
        if current.active == active {
            return Some(current);
        }

        let updated = entry.update(&self.generations, |regs| {
            let slot = regs.iter_mut().find(|r| r.id == registration.id)?;
            slot.active = active;
            Some(slot.clone())
        })?;
        self.notify(entry.contract);
        Some(updated)
    }

    /// Defensive copy of the active registrations of `C`, in insertion order
    pub fn registrations<C: Contract + ?Sized>(&self) -> Vec<Registration<C>> {
        self.snapshot::<C>().registrations
    }

    /// Point-in-time snapshot of the active registrations of `C`
    pub fn snapshot<C: Contract + ?Sized>(&self) -> RegistrationSnapshot<C> {
        match self.lookup::<C>() {
            Some(entry) => entry.snapshot(),
            None => RegistrationSnapshot {
                contract: ContractId::of::<C>(),
                generation: 0,
                registrations: Vec::new(),
            },
        }
    }

    /// Typed accessor that selects and invokes providers of `C`
    pub fn providers<C: Contract + ?Sized>(&self) -> Providers<'_, C> {
        Providers::new(self)
    }

    /// Unregister everything plugin `owner` supplied, across all contracts.
    ///
    /// Returns the number of registrations removed.
    pub fn retract_owner(&self, owner: &str) -> usize {
        let slots: Vec<Arc<dyn ContractSlot>> = self
            .contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut total = 0;
        for slot in slots {
            let removed = slot.retract_owner(owner, &self.generations);
            if removed > 0 {
                self.notify(slot.contract());
                total += removed;
            }
        }

        if total > 0 {
            tracing::debug!(owner, removed = total, "Retracted plugin registrations");
        }
        total
    }

    /// Contracts that currently have at least one active registration
    pub fn contracts(&self) -> Vec<ContractId> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.active_len() > 0)
            .map(|slot| slot.contract())
            .collect()
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, contract: ContractId) {
        // No receivers is fine
        let _ = self
            .events
            .send(RegistryEvent::RegistrationsChanged { contract });
    }

    fn lookup<C: Contract + ?Sized>(&self) -> Option<Arc<ContractEntry<C>>> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<C>())
            .cloned()
            .and_then(|slot| slot.into_any().downcast::<ContractEntry<C>>().ok())
    }

    fn entry<C: Contract + ?Sized>(&self) -> Arc<ContractEntry<C>> {
        if let Some(entry) = self.lookup::<C>() {
            return entry;
        }

        let mut contracts = self
            .contracts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = contracts
            .get(&TypeId::of::<C>())
            .cloned()
            .and_then(|slot| slot.into_any().downcast::<ContractEntry<C>>().ok())
        {
            return entry;
        }

        let entry = Arc::new(ContractEntry::<C>::new(ContractId::of::<C>()));
        contracts.insert(TypeId::of::<C>(), entry.clone());
        entry
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_plugin_api::Priority;

    trait Sink: Send + Sync {
        fn name(&self) -> &str;
    }

    impl Contract for dyn Sink {
        const CATEGORY: &'static str = "sink";
    }

    trait Source: Send + Sync {}

    impl Contract for dyn Source {
        const CATEGORY: &'static str = "source";
    }

    struct Named(&'static str);

    impl Sink for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    impl Source for Named {}

    fn sink(name: &'static str) -> Arc<dyn Sink> {
        Arc::new(Named(name))
    }

    fn ids(regs: &[Registration<dyn Sink>]) -> Vec<String> {
        regs.iter().map(|r| r.provider_id().to_string()).collect()
    }

    #[test]
    fn register_and_read_in_insertion_order() {
        let registry = ProviderRegistry::new();
        registry
            .register(sink("b"), CapabilityDescriptor::new("b"))
            .unwrap();
        registry
            .register(sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();

        let regs = registry.registrations::<dyn Sink>();
        assert_eq!(ids(&regs), vec!["b", "a"]);
        assert_eq!(regs[1].provider().name(), "a");
        assert_eq!(regs[0].contract().category(), "sink");
    }

    #[test]
    fn duplicate_provider_id_is_rejected() {
        let registry = ProviderRegistry::new();
        registry
            .register(sink("a"), CapabilityDescriptor::new("dup"))
            .unwrap();
        let err = registry
            .register(
                sink("b"),
                CapabilityDescriptor::new("dup").with_priority(Priority::High),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::DuplicateProviderId { ref provider_id, .. } if provider_id == "dup"
        ));
        assert_eq!(registry.registrations::<dyn Sink>().len(), 1);
    }

    #[test]
    fn same_provider_id_allowed_across_contracts() {
        let registry = ProviderRegistry::new();
        registry
            .register(sink("a"), CapabilityDescriptor::new("shared"))
            .unwrap();
        let source: Arc<dyn Source> = Arc::new(Named("a"));
        assert!(
            registry
                .register(source, CapabilityDescriptor::new("shared"))
                .is_ok()
        );
    }

    #[test]
    fn register_then_unregister_restores_previous_set() {
        let registry = ProviderRegistry::new();
        registry
            .register(sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();
        let before = ids(&registry.registrations::<dyn Sink>());

        let reg = registry
            .register(sink("b"), CapabilityDescriptor::new("b"))
            .unwrap();
        assert!(registry.unregister(&reg));

        assert_eq!(ids(&registry.registrations::<dyn Sink>()), before);
    }

    #[test]
    fn unregister_twice_is_a_no_op() {
        let registry = ProviderRegistry::new();
        let reg = registry
            .register(sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();
        assert!(registry.unregister(&reg));
        assert!(!registry.unregister(&reg));
    }

    #[test]
    fn snapshot_is_not_affected_by_later_writes() {
        let registry = ProviderRegistry::new();
        registry
            .register(sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();
        let snapshot = registry.snapshot::<dyn Sink>();

        registry
            .register(sink("b"), CapabilityDescriptor::new("b"))
            .unwrap();

        assert_eq!(snapshot.len(), 1);
        let fresh = registry.snapshot::<dyn Sink>();
        assert_eq!(fresh.len(), 2);
        assert!(fresh.generation() > snapshot.generation());
    }

    #[test]
    fn inactive_registrations_are_hidden() {
        let registry = ProviderRegistry::new();
        let reg = registry
            .register(sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();

        let inactive = registry.set_active(&reg, false).unwrap();
        assert!(!inactive.is_active());
        assert!(registry.registrations::<dyn Sink>().is_empty());
        assert!(registry.contracts().is_empty());

        let active = registry.set_active(&reg, true).unwrap();
        assert!(active.is_active());
        assert_eq!(registry.registrations::<dyn Sink>().len(), 1);
    }

    #[test]
    fn set_active_on_removed_registration_returns_none() {
        let registry = ProviderRegistry::new();
        let reg = registry
            .register(sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();
        registry.unregister(&reg);
        assert!(registry.set_active(&reg, true).is_none());
    }

    #[test]
    fn retract_owner_spans_contracts() {
        let registry = ProviderRegistry::new();
        registry
            .register_owned("plugin-x", sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();
        registry
            .register(sink("b"), CapabilityDescriptor::new("b"))
            .unwrap();
        let source: Arc<dyn Source> = Arc::new(Named("s"));
        registry
            .register_owned("plugin-x", source, CapabilityDescriptor::new("s"))
            .unwrap();

        assert_eq!(registry.retract_owner("plugin-x"), 2);
        assert_eq!(ids(&registry.registrations::<dyn Sink>()), vec!["b"]);
        assert!(registry.registrations::<dyn Source>().is_empty());
        assert_eq!(registry.retract_owner("plugin-x"), 0);
    }

    #[test]
    fn unknown_contract_reads_empty() {
        let registry = ProviderRegistry::new();
        let snapshot = registry.snapshot::<dyn Source>();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation(), 0);
    }

    #[tokio::test]
    async fn changes_are_notified() {
        let registry = ProviderRegistry::new();
        let mut rx = registry.subscribe();

        let reg = registry
            .register(sink("a"), CapabilityDescriptor::new("a"))
            .unwrap();
        registry.unregister(&reg);
        // Already removed: no notification
        registry.unregister(&reg);

        let expected = RegistryEvent::RegistrationsChanged {
            contract: ContractId::of::<dyn Sink>(),
        };
        assert_eq!(rx.recv().await.unwrap(), expected);
        assert_eq!(rx.recv().await.unwrap(), expected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_writers_never_lose_registrations() {
        let registry = Arc::new(ProviderRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("t{t}-{i}");
                        registry
                            .register(sink("x"), CapabilityDescriptor::new(id))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.registrations::<dyn Sink>().len(), 400);
    }
}
