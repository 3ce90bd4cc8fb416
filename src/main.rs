//! Consumet extension engine - command line interface
//!
//! Manages installed extensions and calls into them from the shell.

use consumet_extensions::core::config::{CliArgs, Config};
use consumet_extensions::core::Logger;
use consumet_extensions::extension::{
    ExecutionBackend, ExtensionCategory, ExtensionManager, ExtensionStatus, NodeBackend, SearchFilters,
};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "consumet", version, about = "Load and run Consumet provider extensions")]
struct Cli {
    #[command(flatten)]
    config: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the loaded registries
    Registry,

    /// Search extensions across all registries
    Search {
        /// Free-text query on name and description
        query: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        nsfw: Option<bool>,
        #[arg(long)]
        language: Option<String>,
        /// Match any of these tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Install an extension by id
    Install { id: String },

    /// Uninstall an extension by id
    Uninstall { id: String },

    /// List installed extensions
    Installed,

    /// Show installed extensions with newer versions available
    Updates,

    /// Call a provider method; arguments are parsed as JSON, falling back to strings
    Call {
        id: String,
        method: String,
        args: Vec<String>,
        /// Factory to instantiate instead of the manifest default
        #[arg(long)]
        factory: Option<String>,
    },

    /// Resolve an embed URL with the extractor for a server name
    Extract { server: String, url: String },

    /// Start the Node backend and measure its round-trip latency
    PingNode,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn search_filters(
    query: Option<String>,
    category: Option<String>,
    status: Option<String>,
    nsfw: Option<bool>,
    language: Option<String>,
    tags: Vec<String>,
) -> Result<SearchFilters> {
    Ok(SearchFilters {
        category: category
            .map(|c| c.parse::<ExtensionCategory>())
            .transpose()
            .map_err(|e| anyhow!(e))?,
        status: status
            .map(|s| s.parse::<ExtensionStatus>())
            .transpose()
            .map_err(|e| anyhow!(e))?,
        nsfw,
        language,
        tags,
        query,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.engine.backend,
        registries = config.registry.sources.len(),
        "Starting consumet"
    );

    if let Command::PingNode = cli.command {
        let backend = NodeBackend::new(&config.engine);
        let latency = backend.ping().await?;
        println!("node responded in {:.1}ms", latency.as_secs_f64() * 1000.0);
        backend.shutdown().await?;
        return Ok(());
    }

    let manager = ExtensionManager::from_config(&config).await?;
    let outcome = run(&manager, cli.command).await;
    manager.shutdown().await?;
    outcome
}

async fn run(manager: &ExtensionManager, command: Command) -> Result<()> {
    match command {
        Command::Registry => {
            let registry = manager.registry().read().await;
            print_json(&registry.registries())
        }
        Command::Search {
            query,
            category,
            status,
            nsfw,
            language,
            tags,
        } => {
            let filters = search_filters(query, category, status, nsfw, language, tags)?;
            print_json(&manager.search_extensions(&filters).await)
        }
        Command::Install { id } => {
            let result = manager.install_extension(&id).await;
            print_json(&result)?;
            if result.success {
                Ok(())
            } else {
                Err(anyhow!("installing {} failed", id))
            }
        }
        Command::Uninstall { id } => {
            if manager.uninstall_extension(&id).await {
                println!("uninstalled {}", id);
                Ok(())
            } else {
                Err(anyhow!("{} is not installed", id))
            }
        }
        Command::Installed => print_json(&manager.list_installed().await),
        Command::Updates => print_json(&manager.check_for_updates().await),
        Command::Call {
            id,
            method,
            args,
            factory,
        } => {
            let provider = match factory {
                Some(factory) => manager.create_provider(&id, &factory).await?,
                None => manager.provider(&id).await?,
            };
            let args = args.iter().map(|raw| parse_arg(raw)).collect();
            print_json(&provider.call(&method, args).await?)
        }
        Command::Extract { server, url } => {
            let extractor = manager.extractors().get_extractor(&server).await?;
            print_json(&extractor.extract(&url, Vec::new()).await?)
        }
        Command::PingNode => Ok(()),
    }
}
