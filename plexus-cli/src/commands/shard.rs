//! Shard routing preview.
//!
//! Registers placeholder providers under the given ids and runs the
//! category's sharded strategy against them, showing which provider an
//! event would be routed to.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use plexus_core::selection::{DEFAULT_SHARD_FIELD, Sharded};
use plexus_core::{ProviderRegistry, Router, SelectionStrategy};
use plexus_plugin_api::{CapabilityDescriptor, Contract, Metadata};

use crate::config::PlexusConfig;

/// Shard arguments.
#[derive(Args, Debug)]
pub struct ShardArgs {
    /// Category whose routing to use
    pub category: String,

    /// Event name, e.g. player.level.complete
    pub event: String,

    /// Provider ids to route across
    #[arg(long, value_delimiter = ',', required = true)]
    pub providers: Vec<String>,
}

/// Stand-in for whatever contract the category really routes
trait Placeholder: Send + Sync {}

impl Contract for dyn Placeholder {
    const CATEGORY: &'static str = "shard-preview";
}

struct Stub;

impl Placeholder for Stub {}

/// Outcome of routing one event
#[derive(Debug, PartialEq, Eq)]
struct Preview {
    shard_key: String,
    selected: Vec<String>,
}

/// Run shard command.
pub fn run(args: ShardArgs, config: &PlexusConfig) -> Result<()> {
    let preview = preview(&args, config)?;
    println!("Shard key: {}", preview.shard_key);
    match preview.selected.as_slice() {
        [] => println!("Routed to: (none)"),
        [one] => println!("Routed to: {one}"),
        many => println!("Routed to: {} (fan-out fallback)", many.join(", ")),
    }
    Ok(())
}

fn preview(args: &ShardArgs, config: &PlexusConfig) -> Result<Preview> {
    let registry = ProviderRegistry::new();
    for id in &args.providers {
        registry.register::<dyn Placeholder>(Arc::new(Stub), CapabilityDescriptor::new(id))?;
    }

    let router = Router::from_config(&config.routing);
    let strategy = router.strategy(&args.category);
    let sharded = match strategy.as_ref() {
        SelectionStrategy::Sharded(sharded) => sharded.clone(),
        other => {
            println!(
                "Category '{}' uses {}; previewing with default sharding",
                args.category,
                other.strategy_type()
            );
            Sharded::new()
        }
    };

    let mut metadata = Metadata::new();
    let field = config
        .routing
        .category(&args.category)
        .and_then(|c| c.shard_key_field.clone())
        .unwrap_or_else(|| DEFAULT_SHARD_FIELD.to_string());
    metadata.insert(field, args.event.clone().into());

    let shard_key = sharded.shard_key(&metadata);
    let selection = registry
        .providers::<dyn Placeholder>()
        .select(&SelectionStrategy::Sharded(sharded), metadata)?;

    Ok(Preview {
        shard_key,
        selected: selection
            .provider_ids()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}
