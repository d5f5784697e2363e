//! Selection strategies and routing
//!
//! A strategy turns a registration snapshot plus call metadata into the
//! providers to invoke:
//!
//! - [`PickOne`]: the single best match, optionally cached per generation
//! - [`FanOut`]: every match, ordered by provider id
//! - [`Sharded`]: one match chosen by a key derived from call metadata
//!
//! [`Router`] builds one strategy per category from [`RoutingConfig`](crate::config::RoutingConfig).

mod cache;
mod filter;
mod router;
mod shard;
mod strategy;

pub use cache::{CacheKey, DEFAULT_CACHE_TTL, SelectionCache};
pub use filter::{MetadataPredicate, SelectionFilter};
pub use router::Router;
pub use shard::{
    DEFAULT_SHARD_FIELD, DEFAULT_SHARD_KEY, ShardKeyFn, bucket_for, fnv1a64, jump_hash,
    prefix_key,
};
pub use strategy::{
    FanOut, PickOne, SelectionContext, SelectionResult, SelectionStrategy, Sharded, StrategyType,
};
