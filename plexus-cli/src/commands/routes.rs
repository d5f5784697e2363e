//! Routing table inspection.

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use plexus_core::config::CategoryConfig;
use plexus_core::{Router, StrategyType};

use crate::config::PlexusConfig;

/// Routes arguments.
#[derive(Args, Debug)]
pub struct RoutesArgs {
    /// Print the routing section as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run routes command.
pub fn run(args: RoutesArgs, config: &PlexusConfig) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(&config.routing)?);
        return Ok(());
    }

    let router = Router::from_config(&config.routing);
    let mut routes = router.routes();
    routes.sort_by(|a, b| a.0.cmp(b.0));

    if routes.is_empty() {
        println!("No categories configured.");
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Category").fg(Color::Cyan),
            Cell::new("Strategy").fg(Color::Cyan),
            Cell::new("Details").fg(Color::Cyan),
        ]);

        for (category, strategy) in routes {
            let details = config
                .routing
                .category(category)
                .map(|settings| describe(config, category, strategy, settings))
                .unwrap_or_default();
            table.add_row(vec![
                Cell::new(category),
                Cell::new(strategy.to_string()),
                Cell::new(details),
            ]);
        }

        println!("{table}");
    }

    println!();
    println!(
        "Unconfigured categories: pick_one (cached {}ms)",
        config.routing.cache_ttl_ms
    );
    Ok(())
}

/// One-line summary of the settings that matter for `strategy`
fn describe(
    config: &PlexusConfig,
    category: &str,
    strategy: StrategyType,
    settings: &CategoryConfig,
) -> String {
    let mut parts = Vec::new();
    if !settings.required_tags.is_empty() {
        let tags: Vec<&str> = settings.required_tags.iter().map(String::as_str).collect();
        parts.push(format!("tags: {}", tags.join(", ")));
    }

    match strategy {
        StrategyType::PickOne => {
            parts.push(format!(
                "ttl: {}ms",
                config.routing.cache_ttl(category).as_millis()
            ));
        }
        StrategyType::FanOut => {}
        StrategyType::Sharded => {
            if let Some(field) = &settings.shard_key_field {
                parts.push(format!("key: {field}"));
            }
            for (key, provider) in &settings.shard_map {
                parts.push(format!("{key} -> {provider}"));
            }
            if settings.fallback_to_fan_out {
                parts.push("fallback: fan_out".to_string());
            }
        }
    }

    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::RoutingConfig;

    fn config(toml_str: &str) -> PlexusConfig {
        PlexusConfig {
            routing: RoutingConfig::from_toml_str(toml_str).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn describe_sharded_lists_routes_and_fallback() {
        let config = config(
            r#"
[categories.analytics]
strategy = "sharded"
shard_key_field = "topic"
shard_map = { system = "audit" }
fallback_to_fan_out = true
"#,
        );
        let settings = config.routing.category("analytics").unwrap();
        let details = describe(&config, "analytics", StrategyType::Sharded, settings);
        assert_eq!(details, "key: topic; system -> audit; fallback: fan_out");
    }

    #[test]
    fn describe_pick_one_shows_effective_ttl() {
        let config = config(
            r#"
cache_ttl_ms = 1000

[categories.storage]
required_tags = ["linux"]
cache_ttl_ms = 250
"#,
        );
        let settings = config.routing.category("storage").unwrap();
        let details = describe(&config, "storage", StrategyType::PickOne, settings);
        assert_eq!(details, "tags: linux; ttl: 250ms");
    }

    #[test]
    fn run_prints_without_categories() {
        let result = run(RoutesArgs { json: false }, &PlexusConfig::default());
        assert!(result.is_ok());
    }
}
