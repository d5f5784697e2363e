//! Selection strategies: pick-one, fan-out, sharded
//!
//! Every strategy first applies its capability filter (merged with the
//! caller's) to the snapshot in the [`SelectionContext`], then narrows the
//! survivors. Selecting nothing is a normal outcome, never an error.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use plexus_plugin_api::Metadata;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::cache::{CacheKey, DEFAULT_CACHE_TTL, SelectionCache};
use super::filter::SelectionFilter;
use super::shard::{ShardKeyFn, bucket_for};
use crate::error::SelectionError;
use crate::providers::{ContractId, Registration, RegistrationSnapshot};

/// Strategy kinds, as named in routing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    #[default]
    PickOne,
    FanOut,
    Sharded,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StrategyType::PickOne => "pick_one",
            StrategyType::FanOut => "fan_out",
            StrategyType::Sharded => "sharded",
        })
    }
}

/// Inputs to one selection
pub struct SelectionContext<C: ?Sized> {
    snapshot: RegistrationSnapshot<C>,
    call_metadata: Metadata,
    filter: SelectionFilter,
    cancellation: CancellationToken,
}

impl<C: ?Sized> SelectionContext<C> {
    pub fn new(snapshot: RegistrationSnapshot<C>) -> Self {
        Self {
            snapshot,
            call_metadata: Metadata::new(),
            filter: SelectionFilter::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Builder: per-call metadata, read by the sharded key function
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.call_metadata = metadata;
        self
    }

    /// Builder: set one call-metadata field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.call_metadata.insert(key.into(), value.into());
        self
    }

    /// Builder: extra criteria on top of the strategy's own filter
    pub fn with_filter(mut self, filter: SelectionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Builder: cancellation for the calls made on the selected providers
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn contract(&self) -> ContractId {
        self.snapshot.contract()
    }

    pub fn snapshot(&self) -> &RegistrationSnapshot<C> {
        &self.snapshot
    }

    pub fn call_metadata(&self) -> &Metadata {
        &self.call_metadata
    }

    pub fn filter(&self) -> &SelectionFilter {
        &self.filter
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Providers chosen by a strategy, in invocation order
pub struct SelectionResult<C: ?Sized> {
    pub selected: Vec<Registration<C>>,
    pub strategy: StrategyType,
}

impl<C: ?Sized> SelectionResult<C> {
    fn from_refs(strategy: StrategyType, selected: Vec<&Registration<C>>) -> Self {
        Self {
            selected: selected.into_iter().cloned().collect(),
            strategy,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    /// First selected provider, the only one for pick-one and sharded
    pub fn first(&self) -> Option<&Registration<C>> {
        self.selected.first()
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.selected.iter().map(|r| r.provider_id()).collect()
    }
}

impl<C: ?Sized> std::fmt::Debug for SelectionResult<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionResult")
            .field("strategy", &self.strategy)
            .field("selected", &self.provider_ids())
            .finish()
    }
}

/// Single best provider: highest priority, ties broken by lowest provider id
#[derive(Debug, Clone, Default)]
pub struct PickOne {
    pub filter: SelectionFilter,
    pub cache: Option<Arc<SelectionCache>>,
    pub ttl: Option<Duration>,
}

impl PickOne {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: SelectionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_cache(mut self, cache: Arc<SelectionCache>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.ttl = Some(ttl);
        self
    }

    fn select<C: ?Sized>(
        &self,
        ctx: &SelectionContext<C>,
    ) -> Result<SelectionResult<C>, SelectionError> {
        let filter = self.filter.merged(ctx.filter());
        let registrations = ctx.snapshot().registrations();
        let generation = ctx.snapshot().generation();
        let key = CacheKey::new(ctx.contract(), filter.cache_key());

        if let Some(cache) = &self.cache
            && let Some(provider_id) = cache.get(&key, generation)
            && let Some(hit) = registrations
                .iter()
                .find(|r| r.provider_id() == provider_id)
        {
            return Ok(SelectionResult::from_refs(StrategyType::PickOne, vec![hit]));
        }

        let survivors = filter.apply(registrations)?;
        let winner = survivors.into_iter().min_by(|a, b| {
            b.capabilities()
                .priority
                .cmp(&a.capabilities().priority)
                .then_with(|| a.provider_id().cmp(b.provider_id()))
        });

        if let (Some(cache), Some(winner)) = (&self.cache, winner) {
            cache.insert(
                key,
                generation,
                winner.provider_id(),
                self.ttl.unwrap_or(DEFAULT_CACHE_TTL),
            );
        }
        Ok(SelectionResult::from_refs(
            StrategyType::PickOne,
            winner.into_iter().collect(),
        ))
    }
}

/// Every provider that survives the filter, ordered by provider id
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    pub filter: SelectionFilter,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: SelectionFilter) -> Self {
        self.filter = filter;
        self
    }

    fn select<C: ?Sized>(
        &self,
        ctx: &SelectionContext<C>,
    ) -> Result<SelectionResult<C>, SelectionError> {
        let mut survivors = self
            .filter
            .merged(ctx.filter())
            .apply(ctx.snapshot().registrations())?;
        survivors.sort_by(|a, b| a.provider_id().cmp(b.provider_id()));
        Ok(SelectionResult::from_refs(StrategyType::FanOut, survivors))
    }
}

/// One provider chosen by a key derived from call metadata.
///
/// An explicit `shard_map` entry wins; other keys are consistently hashed
/// over the eligible providers sorted by id.
#[derive(Debug, Clone, Default)]
pub struct Sharded {
    pub filter: SelectionFilter,
    pub key_fn: ShardKeyFn,
    pub shard_map: IndexMap<String, String>,
    /// Select every eligible provider when the routed owner is gone
    pub fallback_to_fan_out: bool,
}

impl Sharded {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: SelectionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_key_fn(mut self, key_fn: ShardKeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    /// Builder: route `shard_key` to `provider_id`
    pub fn with_route(mut self, shard_key: impl Into<String>, provider_id: impl Into<String>) -> Self {
        self.shard_map.insert(shard_key.into(), provider_id.into());
        self
    }

    pub fn with_fallback_to_fan_out(mut self, fallback: bool) -> Self {
        self.fallback_to_fan_out = fallback;
        self
    }

    /// Shard key for the given call metadata
    pub fn shard_key(&self, call_metadata: &Metadata) -> String {
        self.key_fn.key(call_metadata)
    }

    fn select<C: ?Sized>(
        &self,
        ctx: &SelectionContext<C>,
    ) -> Result<SelectionResult<C>, SelectionError> {
        let mut eligible = self
            .filter
            .merged(ctx.filter())
            .apply(ctx.snapshot().registrations())?;
        eligible.sort_by(|a, b| a.provider_id().cmp(b.provider_id()));

        let shard_key = self.shard_key(ctx.call_metadata());
        let owner = match self.shard_map.get(&shard_key) {
            Some(mapped) => eligible.iter().find(|r| r.provider_id() == mapped).copied(),
            None => bucket_for(&shard_key, eligible.len()).and_then(|b| eligible.get(b).copied()),
        };

        let selected = match owner {
            Some(owner) => vec![owner],
            None if self.fallback_to_fan_out => eligible,
            None => Vec::new(),
        };
        tracing::trace!(
            contract = %ctx.contract(),
            shard_key = %shard_key,
            selected = selected.len(),
            "Sharded selection"
        );
        Ok(SelectionResult::from_refs(StrategyType::Sharded, selected))
    }
}

/// A configured selection strategy
#[derive(Debug, Clone)]
pub enum SelectionStrategy {
    PickOne(PickOne),
    FanOut(FanOut),
    Sharded(Sharded),
}

impl SelectionStrategy {
    pub fn strategy_type(&self) -> StrategyType {
        match self {
            SelectionStrategy::PickOne(_) => StrategyType::PickOne,
            SelectionStrategy::FanOut(_) => StrategyType::FanOut,
            SelectionStrategy::Sharded(_) => StrategyType::Sharded,
        }
    }

    /// Choose providers from the snapshot in `ctx`.
    ///
    /// Pure apart from the pick-one cache; never blocks on registry writers.
    pub fn select<C: ?Sized>(
        &self,
        ctx: &SelectionContext<C>,
    ) -> Result<SelectionResult<C>, SelectionError> {
        match self {
            SelectionStrategy::PickOne(s) => s.select(ctx),
            SelectionStrategy::FanOut(s) => s.select(ctx),
            SelectionStrategy::Sharded(s) => s.select(ctx),
        }
    }
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::PickOne(PickOne::default())
    }
}

impl From<PickOne> for SelectionStrategy {
    fn from(s: PickOne) -> Self {
        SelectionStrategy::PickOne(s)
    }
}

impl From<FanOut> for SelectionStrategy {
    fn from(s: FanOut) -> Self {
        SelectionStrategy::FanOut(s)
    }
}

impl From<Sharded> for SelectionStrategy {
    fn from(s: Sharded) -> Self {
        SelectionStrategy::Sharded(s)
    }
}
