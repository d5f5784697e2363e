//! Pick-one result cache
//!
//! Entries are keyed by contract and canonical filter criteria and stamped
//! with the registry generation they were computed from. A lookup only hits
//! when the stamp equals the generation of the caller's snapshot, so a
//! cached provider is never returned after its registration set changed,
//! even before the change notification has been processed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::RegistryEvent;
use crate::providers::{ContractId, ProviderRegistry};

/// Default time-to-live for cached selections
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Cache key: contract plus canonical serialized filter criteria
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub contract: ContractId,
    pub criteria: String,
}

impl CacheKey {
    pub fn new(contract: ContractId, criteria: impl Into<String>) -> Self {
        Self {
            contract,
            criteria: criteria.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    generation: u64,
    provider_id: String,
    expires_at: Instant,
}

/// Process-wide cache of pick-one winners, shared by every pick-one strategy
/// a [`Router`](super::Router) builds.
#[derive(Debug, Default)]
pub struct SelectionCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl SelectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached winner for `key`, valid only for `generation` and before expiry
    pub fn get(&self, key: &CacheKey, generation: u64) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        if entry.generation == generation && Instant::now() < entry.expires_at {
            return Some(entry.provider_id.clone());
        }
        // An entry from a newer generation belongs to a fresher reader; keep it
        if entry.generation < generation || Instant::now() >= entry.expires_at {
            entries.remove(key);
        }
        None
    }

    /// Record the winner computed from `generation`.
    ///
    /// Never replaces an entry computed from a newer generation.
    pub fn insert(&self, key: CacheKey, generation: u64, provider_id: &str, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(&key)
            .is_some_and(|existing| existing.generation > generation)
        {
            return;
        }
        entries.insert(
            key,
            CacheEntry {
                generation,
                provider_id: provider_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every entry for `contract`; returns how many were dropped
    pub fn invalidate(&self, contract: ContractId) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| key.contract != contract);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a task that invalidates entries whenever `registry` reports a
    /// change. The task ends when the registry is dropped.
    pub fn spawn_invalidator(self: &Arc<Self>, registry: &ProviderRegistry) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut rx = registry.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RegistryEvent::RegistrationsChanged { contract }) => {
                        let dropped = cache.invalidate(contract);
                        tracing::trace!(%contract, dropped, "Selection cache invalidated");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Selection cache lagged, clearing");
                        cache.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_plugin_api::{CapabilityDescriptor, Contract};

    trait Sampled: Send + Sync {}

    impl Contract for dyn Sampled {
        const CATEGORY: &'static str = "sampled";
    }

    struct P;
    impl Sampled for P {}

    fn key() -> CacheKey {
        CacheKey::new(ContractId::of::<dyn Sampled>(), "{}")
    }

    #[test]
    fn hit_requires_matching_generation() {
        let cache = SelectionCache::new();
        cache.insert(key(), 3, "p1", DEFAULT_CACHE_TTL);

        assert_eq!(cache.get(&key(), 3).as_deref(), Some("p1"));
        assert_eq!(cache.get(&key(), 4), None);
        // The stale entry was evicted by the newer reader
        assert!(cache.is_empty());
    }

    #[test]
    fn older_reader_does_not_evict_newer_entry() {
        let cache = SelectionCache::new();
        cache.insert(key(), 5, "p2", DEFAULT_CACHE_TTL);

        assert_eq!(cache.get(&key(), 4), None);
        assert_eq!(cache.get(&key(), 5).as_deref(), Some("p2"));
    }

    #[test]
    fn insert_never_downgrades_generation() {
        let cache = SelectionCache::new();
        cache.insert(key(), 5, "new", DEFAULT_CACHE_TTL);
        cache.insert(key(), 4, "old", DEFAULT_CACHE_TTL);
        assert_eq!(cache.get(&key(), 5).as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = SelectionCache::new();
        cache.insert(key(), 1, "p1", Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get(&key(), 1).is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&key(), 1).is_none());
    }

    #[test]
    fn invalidate_only_touches_one_contract() {
        trait Other: Send + Sync {}
        impl Contract for dyn Other {
            const CATEGORY: &'static str = "other";
        }

        let cache = SelectionCache::new();
        cache.insert(key(), 1, "p1", DEFAULT_CACHE_TTL);
        cache.insert(
            CacheKey::new(ContractId::of::<dyn Other>(), "{}"),
            1,
            "o1",
            DEFAULT_CACHE_TTL,
        );

        assert_eq!(cache.invalidate(ContractId::of::<dyn Sampled>()), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidator_reacts_to_registry_changes() {
        let registry = ProviderRegistry::new();
        let cache = Arc::new(SelectionCache::new());
        let task = cache.spawn_invalidator(&registry);

        cache.insert(key(), 0, "p1", DEFAULT_CACHE_TTL);
        registry
            .register::<dyn Sampled>(Arc::new(P), CapabilityDescriptor::new("p1"))
            .unwrap();

        for _ in 0..100 {
            if cache.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(cache.is_empty());

        drop(registry);
        task.await.unwrap();
    }
}
