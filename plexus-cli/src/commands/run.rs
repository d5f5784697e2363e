//! Plugin host runner.
//!
//! Loads every plugin listed in a manifest, activates it, and keeps the
//! host alive until Ctrl-C. On shutdown each plugin is deactivated and
//! unloaded in reverse load order, and the reclamation outcome of every
//! load context is reported.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use plexus_core::{
    DylibLoader, PluginEvent, PluginHost, PluginHostError, ProviderRegistry, ReleaseOutcome,
};
use plexus_plugin_api::PluginDescriptor;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::PlexusConfig;

/// Run arguments.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Plugin manifest (TOML with one [[plugins]] table per plugin)
    pub manifest: PathBuf,

    /// Load plugins without activating them
    #[arg(long)]
    pub no_activate: bool,
}

/// Plugins to host, in load order
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    plugins: Vec<PluginDescriptor>,
}

impl Manifest {
    /// Parse a manifest; relative code unit paths resolve against `base_dir`
    fn parse(contents: &str, base_dir: &Path) -> Result<Self> {
        let mut manifest: Manifest = toml::from_str(contents)?;
        for plugin in &mut manifest.plugins {
            for path in &mut plugin.code_unit_paths {
                if path.is_relative() {
                    *path = base_dir.join(&*path);
                }
            }
        }
        Ok(manifest)
    }

    fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let base_dir = path.parent().unwrap_or(Path::new("."));
        Self::parse(&contents, base_dir)
            .with_context(|| format!("Invalid manifest {}", path.display()))
    }
}

/// Run the plugin host.
pub async fn run(args: RunArgs, config: &PlexusConfig) -> Result<()> {
    let manifest = Manifest::load(&args.manifest)?;
    if manifest.plugins.is_empty() {
        println!("No plugins listed in {}.", args.manifest.display());
        return Ok(());
    }

    let host = Arc::new(PluginHost::new(
        config.plugin_host_config()?,
        Arc::new(DylibLoader::new()),
        Arc::new(ProviderRegistry::new()),
    ));
    let events = tokio::spawn(log_events(host.subscribe()));

    let mut loaded = Vec::new();
    for descriptor in manifest.plugins {
        let id = descriptor.id.clone();
        if let Err(e) = host.load_plugin(descriptor).await {
            warn!(plugin = %id, error = %e, "Skipping plugin");
            continue;
        }
        if !args.no_activate
            && let Err(e) = host.activate(&id).await
        {
            warn!(plugin = %id, error = %e, "Plugin stays loaded but inactive");
        }
        loaded.push(id);
    }

    info!(plugins = loaded.len(), "Plugin host running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stopping plugins");

    let mut outcomes = Vec::new();
    for id in loaded.iter().rev() {
        match stop_plugin(&host, id).await {
            Ok(outcome) => outcomes.push((id.clone(), outcome)),
            Err(e) => warn!(plugin = %id, error = %e, "Failed to stop plugin"),
        }
    }
    // Anything a refused transition left behind
    outcomes.extend(host.shutdown().await);
    events.abort();

    print_outcomes(&outcomes);
    Ok(())
}

/// Deactivate then unload; a refusal escalates to a forced unload
async fn stop_plugin(host: &PluginHost, id: &str) -> Result<ReleaseOutcome, PluginHostError> {
    match host.deactivate(id).await {
        Ok(()) => host.unload(id).await,
        Err(PluginHostError::UnloadRefused { reason, .. }) => {
            warn!(plugin = %id, reason = %reason, "Unload refused, forcing");
            host.force_unload(id).await
        }
        Err(e) => Err(e),
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<PluginEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(PluginEvent::Loaded { id, descriptor }) => {
                info!(plugin = %id, version = %descriptor.version, "Loaded");
            }
            Ok(PluginEvent::Activated { id }) => info!(plugin = %id, "Activated"),
            Ok(PluginEvent::Deactivated { id }) => info!(plugin = %id, "Deactivated"),
            Ok(PluginEvent::Unloaded { id, unloaded, .. }) => {
                info!(plugin = %id, reclaimed = unloaded, "Unloaded");
            }
            Ok(PluginEvent::Failed {
                id,
                operation,
                error,
            }) => warn!(plugin = %id, operation, error = %error, "Transition failed"),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Plugin event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_outcomes(outcomes: &[(String, ReleaseOutcome)]) {
    if outcomes.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Plugin").fg(Color::Cyan),
        Cell::new("Reclaimed").fg(Color::Cyan),
        Cell::new("Live Instances").fg(Color::Cyan),
        Cell::new("Error").fg(Color::Cyan),
    ]);

    for (id, outcome) in outcomes {
        let reclaimed = if outcome.unloaded {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(id),
            reclaimed,
            Cell::new(outcome.live_instances),
            Cell::new(outcome.error.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{table}");
}
