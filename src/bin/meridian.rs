#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use meridian::config::EngineConfig;
use meridian::gateway::{ProviderGateway, StderrUsageSink};
use meridian::registry::Registry;
use meridian::workflow::Workflow;

#[derive(Parser)]
#[command(name = "meridian", version, about = "Strategic analysis scoring engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full analysis and write the result document as JSON
    Run {
        /// The strategic question to analyze
        query: String,
        /// Engine config file (JSON); env-based defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Taxonomy file (JSON); built-in taxonomy when omitted
        #[arg(long)]
        taxonomy: Option<PathBuf>,
        /// Output path; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
        /// Extra context as key=value pairs
        #[arg(long)]
        context: Vec<String>,
    },
    /// Validate a taxonomy file (or the built-in one)
    Validate {
        #[arg(long)]
        taxonomy: Option<PathBuf>,
    },
    /// Dump the built-in taxonomy as JSON
    Taxonomy,
}

fn load_registry(path: Option<&PathBuf>) -> Result<Registry, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(Registry::from_json(&raw)?)
        }
        None => Ok(Registry::builtin()),
    }
}

fn parse_context(pairs: &[String]) -> BTreeMap<String, serde_json::Value> {
    pairs
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            query,
            config,
            taxonomy,
            out,
            context,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_file(path)?,
                None => EngineConfig::from_env()?,
            };
            let registry = Arc::new(load_registry(taxonomy.as_ref())?);
            registry.validate()?;

            let gateway = ProviderGateway::from_routes(
                &config.routes,
                Arc::new(StderrUsageSink),
                config.gateway_config(),
            )?;

            let workflow = Workflow::new(registry, Arc::new(gateway), config);
            let outcome = workflow.run(&query, parse_context(&context), None).await?;

            let json = serde_json::to_string_pretty(&outcome.document)?;
            match out {
                Some(path) => {
                    let mut file = File::create(&path)?;
                    file.write_all(json.as_bytes())?;
                    eprintln!("report written to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Validate { taxonomy } => {
            let registry = load_registry(taxonomy.as_ref())?;
            registry.validate()?;
            println!(
                "taxonomy OK: {} segments, {} factors, {} units",
                registry.segments.len(),
                registry.factors.len(),
                registry.unit_count()
            );
        }
        Commands::Taxonomy => {
            println!("{}", serde_json::to_string_pretty(&Registry::builtin())?);
        }
    }

    Ok(())
}
