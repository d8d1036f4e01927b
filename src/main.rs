use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lcd_host::HostConfig;
use lcd_host::plugin::loader::{ModuleLoader, NativeModuleLoader};
use lcd_host::plugin::runtime::{Device, Panel, PluginRuntime, RuntimeKind};
use lcd_host::plugin::{DiscoveryReport, PluginStatus};

/// LCD host - plugin runtime for LCD devices and display panels
#[derive(Parser, Debug)]
#[command(name = "lcd-host")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover plugins and print the catalog with diagnostics
    List,

    /// Show the manifest and state of one plugin
    Inspect {
        /// Plugin id
        id: String,
    },

    /// Load a plugin, print its status, then unload it
    Load {
        /// Plugin id
        id: String,
    },

    /// Print the routing tables
    Routes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_env("LCD_HOST_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            HostConfig::from_file(path).map_err(|e| anyhow!(e.to_string()))?
        }
        None => HostConfig::from_env().map_err(|e| anyhow!(e.to_string()))?,
    };

    let loader: Arc<dyn ModuleLoader> = Arc::new(NativeModuleLoader::new());
    let shared = Arc::new(config.shared_modules(loader.clone()));
    let services = Arc::new(config.host_services());
    let devices: PluginRuntime<Device> = config.runtime(loader.clone(), shared.clone(), services.clone());
    let panels: PluginRuntime<Panel> = config.runtime(loader, shared, services);

    let device_report = devices.discover();
    let panel_report = panels.discover();

    match cli.command {
        Commands::List => {
            print_report(&devices, &device_report);
            print_report(&panels, &panel_report);
        }
        Commands::Inspect { id } => {
            let status = devices.status(&id).or_else(|| panels.status(&id));
            let Some(status) = status else {
                anyhow::bail!("Plugin '{}' was not discovered", id);
            };
            print_status(&status);
            let (device_snapshot, panel_snapshot) = (devices.snapshot(), panels.snapshot());
            let entry = device_snapshot
                .catalog()
                .get(&id)
                .or_else(|| panel_snapshot.catalog().get(&id))
                .cloned();
            if let Some(entry) = entry {
                let manifest = entry.manifest();
                println!("  author:      {}", manifest.author);
                if let Some(description) = &manifest.description {
                    println!("  description: {description}");
                }
                println!("  requires:    runtime >= {}", manifest.minimum_runtime_version);
                println!("  entry:       {}", entry.entry_path().display());
                println!("  capabilities: {}", manifest.capability_count());
            }
        }
        Commands::Load { id } => {
            if devices.status(&id).is_some() {
                load_and_unload(&devices, &id).await?;
            } else if panels.status(&id).is_some() {
                load_and_unload(&panels, &id).await?;
            } else {
                anyhow::bail!("Plugin '{}' was not discovered", id);
            }
        }
        Commands::Routes => {
            let snapshot = devices.snapshot();
            let routes = snapshot.routes();
            println!("Hardware:");
            for ((vendor_id, product_id), owner) in routes.hardware_routes() {
                println!("  usb:{vendor_id:04x}:{product_id:04x} -> {owner}");
            }
            println!("Protocols:");
            for (protocol_id, owner) in routes.protocol_routes() {
                println!("  {protocol_id} -> {owner}");
            }

            let snapshot = panels.snapshot();
            let routes = snapshot.routes();
            println!("Panel types:");
            for (key, route) in routes.panel_type_routes() {
                println!("  {key} -> {} ({})", route.plugin_id, route.type_id);
            }
            println!("Panel prefixes:");
            for (prefix, route) in routes.prefix_routes() {
                println!("  {prefix} -> {} ({})", route.plugin_id, route.type_id);
            }
        }
    }

    devices.shutdown().await;
    panels.shutdown().await;
    Ok(())
}

fn print_report<K: RuntimeKind>(runtime: &PluginRuntime<K>, report: &DiscoveryReport) {
    println!("{} plugins ({}):", runtime.kind(), report.plugin_count());
    for plugin in &report.plugins {
        println!(
            "  {:<32} {:<10} {:<8} {} capabilities  {}",
            plugin.id,
            plugin.version,
            plugin.origin,
            plugin.capability_count,
            plugin.dir.display()
        );
    }
    for diagnostic in &report.diagnostics {
        println!("  {diagnostic}");
    }
}

fn print_status(status: &PluginStatus) {
    println!("{} ({})", status.id, status.name);
    println!("  version:     {}", status.version);
    println!("  origin:      {}", status.origin);
    println!("  directory:   {}", status.dir.display());
    println!("  state:       {}", status.state);
    println!("  loads:       {}", status.load_count);
    if let Some(failure) = &status.last_failure {
        println!("  last error:  {failure}");
    }
    if let Some(stats) = &status.stats {
        println!("  calls:       {} ({} errors)", stats.call_count, stats.error_count);
    }
    if !status.private_modules.is_empty() {
        println!("  modules:     {}", status.private_modules.join(", "));
    }
}

async fn load_and_unload<K: RuntimeKind>(runtime: &PluginRuntime<K>, id: &str) -> anyhow::Result<()> {
    let plugin = runtime
        .ensure_loaded(id)
        .await
        .map_err(|e| anyhow!("Failed to load '{}': {}", id, e))?;
    println!("Loaded {} {} ({})", plugin.name(), plugin.version(), plugin.kind());
    drop(plugin);

    if let Some(status) = runtime.status(id) {
        print_status(&status);
    }
    runtime.unload(id).await;
    println!("Unloaded {id}");
    Ok(())
}
