//! Atrium plugin catalog inspector.
//!
//! Reads a plugin catalog and answers dependency questions about it, or
//! loads the whole catalog into a runtime and reports plugin health.
//!
//! Usage:
//!   atrium --catalog plugins.toml check adv-calc
//!   atrium --catalog plugins.toml order
//!   atrium --catalog plugins.toml --config atrium.toml demo

use anyhow::{Context, Result};
use atrium_cli::{Catalog, render_tree};
use atrium_host::{PluginManager, RuntimeConfig};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "atrium")]
#[command(about = "Inspect and exercise Atrium plugin catalogs")]
struct Args {
    /// Path to the plugin catalog
    #[arg(short, long, default_value = "plugins.toml")]
    catalog: PathBuf,

    /// Path to the runtime configuration
    #[arg(long, default_value = "atrium.toml")]
    config: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check dependency availability and versions
    Check {
        /// Plugin to check (all plugins when omitted)
        plugin: Option<String>,
    },
    /// Print the load order of the given plugins (all when omitted)
    Order { plugins: Vec<String> },
    /// Print the dependency tree of a plugin
    Tree { plugin: String },
    /// Print registry counters and detected cycles
    Info,
    /// Load the catalog into a runtime and report health
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let catalog = Catalog::load(&args.catalog)?;
    info!("Loaded {} plugins from {:?}", catalog.plugins.len(), args.catalog);

    match args.command {
        Command::Check { plugin } => {
            let resolver = catalog.resolver()?;
            let targets = plugin.map_or_else(|| catalog.ids(), |id| vec![id]);
            for id in targets {
                let report = resolver
                    .check_dependencies(&id)
                    .with_context(|| format!("Failed to check '{id}'"))?;
                println!("{id}: {}", serde_json::to_string_pretty(&report)?);
            }
        }
        Command::Order { plugins } => {
            let resolver = catalog.resolver()?;
            let requested = if plugins.is_empty() {
                catalog.ids()
            } else {
                plugins
            };
            let order = resolver
                .get_load_order(&requested)
                .context("Failed to compute load order")?;
            for (position, id) in order.iter().enumerate() {
                println!("{:>3}. {}", position + 1, id);
            }
        }
        Command::Tree { plugin } => {
            let tree = catalog
                .resolver()?
                .get_dependency_tree(&plugin)
                .with_context(|| format!("Failed to build tree for '{plugin}'"))?;
            print!("{}", render_tree(&tree));
        }
        Command::Info => {
            let info = catalog.resolver()?.get_registry_info();
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Demo => demo(&catalog, RuntimeConfig::load_from(&args.config)).await?,
    }
    Ok(())
}

async fn demo(catalog: &Catalog, config: RuntimeConfig) -> Result<()> {
    let manager = PluginManager::new(config);
    catalog.register_all(&manager)?;

    let report = manager
        .load_plugins_in_order(&catalog.ids())
        .await
        .context("Failed to load catalog")?;
    for (plugin_id, reason) in &report.failed {
        warn!("{} failed to load: {}", plugin_id, reason);
    }
    for plugin_id in &report.skipped {
        warn!("{} skipped: a dependency failed to load", plugin_id);
    }

    for (plugin_id, instance_id) in &report.loaded {
        let reply = manager
            .invoke_plugin(*instance_id, json!({ "ping": plugin_id }), None)
            .await
            .with_context(|| format!("'{plugin_id}' did not answer"))?;
        info!("{} answered {}", plugin_id, reply);
    }

    let mut health = Vec::new();
    for plugin_id in catalog.ids() {
        health.push(manager.get_plugin_health(&plugin_id).await?);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "loaded": report.loaded.len(),
            "failed": report.failed,
            "skipped": report.skipped,
            "health": health,
            "pools": manager.get_resource_pool_status(),
        }))?
    );

    manager.shutdown().await;
    Ok(())
}
