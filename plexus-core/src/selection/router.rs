//! Router - category name -> configured selection strategy

use std::collections::HashMap;
use std::sync::Arc;

use plexus_plugin_api::Contract;

use super::cache::SelectionCache;
use super::filter::SelectionFilter;
use super::shard::ShardKeyFn;
use super::strategy::{FanOut, PickOne, SelectionStrategy, Sharded, StrategyType};
use crate::config::{CategoryConfig, RoutingConfig};
use crate::providers::ProviderRegistry;

/// Strategies for every configured category, sharing one pick-one cache.
///
/// Categories without configuration get a cached pick-one strategy.
#[derive(Debug, Clone)]
pub struct Router {
    strategies: HashMap<String, Arc<SelectionStrategy>>,
    fallback: Arc<SelectionStrategy>,
    cache: Arc<SelectionCache>,
}

impl Router {
    /// Build strategies from routing configuration
    pub fn from_config(config: &RoutingConfig) -> Self {
        let cache = Arc::new(SelectionCache::new());
        let strategies = config
            .categories
            .iter()
            .map(|(category, settings)| {
                let strategy = build_strategy(config, category, settings, &cache);
                tracing::debug!(
                    category = %category,
                    strategy = %strategy.strategy_type(),
                    "Configured route"
                );
                (category.clone(), Arc::new(strategy))
            })
            .collect();

        let fallback = Arc::new(SelectionStrategy::PickOne(
            PickOne::new().with_cache(Arc::clone(&cache), config.cache_ttl("")),
        ));

        Self {
            strategies,
            fallback,
            cache,
        }
    }

    /// Replace or add the strategy for `category`
    pub fn with_strategy(mut self, category: impl Into<String>, strategy: SelectionStrategy) -> Self {
        self.strategies.insert(category.into(), Arc::new(strategy));
        self
    }

    /// Strategy for a category name
    pub fn strategy(&self, category: &str) -> Arc<SelectionStrategy> {
        self.strategies
            .get(category)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Strategy for contract `C`, looked up by its category
    pub fn strategy_for<C: Contract + ?Sized>(&self) -> Arc<SelectionStrategy> {
        self.strategy(C::CATEGORY)
    }

    /// Configured categories and their strategy kinds, in no particular order
    pub fn routes(&self) -> Vec<(&str, StrategyType)> {
        self.strategies
            .iter()
            .map(|(category, strategy)| (category.as_str(), strategy.strategy_type()))
            .collect()
    }

    pub fn cache(&self) -> &Arc<SelectionCache> {
        &self.cache
    }

    /// Keep the shared cache in step with `registry` change notifications
    pub fn watch(&self, registry: &ProviderRegistry) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_invalidator(registry)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}

fn build_strategy(
    config: &RoutingConfig,
    category: &str,
    settings: &CategoryConfig,
    cache: &Arc<SelectionCache>,
) -> SelectionStrategy {
    let filter = SelectionFilter::new().with_tags(settings.required_tags.iter().cloned());
    match settings.strategy {
        StrategyType::PickOne => PickOne::new()
            .with_filter(filter)
            .with_cache(Arc::clone(cache), config.cache_ttl(category))
            .into(),
        StrategyType::FanOut => FanOut::new().with_filter(filter).into(),
        StrategyType::Sharded => {
            let key_fn = settings
                .shard_key_field
                .as_deref()
                .map(ShardKeyFn::prefix_of)
                .unwrap_or_default();
            Sharded {
                filter,
                key_fn,
                shard_map: settings.shard_map.clone(),
                fallback_to_fan_out: settings.fallback_to_fan_out,
            }
            .into()
        }
    }
}
