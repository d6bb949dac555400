//! Kind Atlas CLI
//!
//! Opens a registry directory with in-memory collaborators and invokes
//! capabilities by name.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kind_atlas::config::OutputFormat;
use kind_atlas::{loader, Atlas, AtlasConfig, CapabilityContext, CapabilityRegistry, Caller};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kind-atlas")]
#[command(about = "Map, search and roll back a self-describing record store's schema")]
struct Cli {
    /// Registry directory (overrides the configured path)
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User the operations run as
    #[arg(long, default_value = "Administrator")]
    caller: String,

    /// Overall deadline for fan-out operations, in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered capabilities
    List,

    /// Invoke a capability with JSON arguments
    Invoke {
        /// Capability name (see `list`)
        capability: String,

        /// JSON arguments, e.g. '{"kind": "Customer"}'
        #[arg(default_value = "{}")]
        args: String,
    },

    /// Write the effective configuration as TOML
    Config {
        /// Output file (defaults to atlas.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Export the kind graph to DOT
    GraphExport {
        /// Output file (defaults to kinds.dot)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AtlasConfig::load_from(cli.config.as_deref().and_then(|p| p.to_str())) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.output.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: AtlasConfig) -> anyhow::Result<()> {
    let registry_dir = cli.registry.clone().unwrap_or_else(|| config.registry_path());
    let format = config.output.format;
    let open = |config: AtlasConfig| -> anyhow::Result<Arc<Atlas>> {
        Ok(Arc::new(loader::open(config, &registry_dir)?))
    };

    match cli.command {
        Commands::List => {
            let capabilities = CapabilityRegistry::standard(open(config)?);
            for info in capabilities.list() {
                println!("{:<20} {}", info.name, info.description);
            }
        }

        Commands::Invoke { capability, args } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("Arguments are not valid JSON")?;
            let ctx = CapabilityContext {
                caller: Caller::new(cli.caller),
                deadline: cli.deadline_ms.map(Duration::from_millis),
            };
            let capabilities = CapabilityRegistry::standard(open(config)?);
            let result = capabilities.invoke(&capability, &ctx, args).await?;
            let rendered = match format {
                OutputFormat::Pretty => serde_json::to_string_pretty(&result)?,
                OutputFormat::Compact => serde_json::to_string(&result)?,
            };
            println!("{}", rendered);
        }

        Commands::Config { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from("atlas.toml"));
            config
                .save(&output_path)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            eprintln!("Wrote configuration to {}", output_path.display());
        }

        Commands::GraphExport { output } => {
            let graph = open(config)?.graph();
            let output_path = output.unwrap_or_else(|| PathBuf::from("kinds.dot"));
            std::fs::write(&output_path, graph.to_dot())
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            eprintln!(
                "Exported {} kinds, {} edges to {}",
                graph.kind_count(),
                graph.edge_count(),
                output_path.display()
            );
            for warning in graph.warnings() {
                eprintln!("  warning: {}", warning.message);
            }
        }
    }

    Ok(())
}
