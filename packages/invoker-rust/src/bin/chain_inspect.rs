//! Prints the filter chains a configuration resolves to.
//!
//! ```text
//! chain-inspect --config chains.json --filters auth,rest-client,highway-client --microservice orders
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use rpcflow_core::InvocationType;
use rpcflow_invoker::filter::FilterChainsManager;
use rpcflow_invoker::{Filter, FilterChainsConfig, FilterNode, FilterRegistration, FilterRegistry, FilterResult, Invocation};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chain-inspect")]
#[command(about = "Resolve filter chain configuration and print the built chains")]
struct Cli {
    /// JSON chain configuration
    #[arg(short, long, env = "RPCFLOW_CHAINS")]
    config: Option<PathBuf>,

    /// Registered filter names (comma separated or repeated)
    #[arg(short, long, value_delimiter = ',')]
    filters: Vec<String>,

    /// Microservices to resolve; defaults to every override in the configuration
    #[arg(short, long)]
    microservice: Vec<String>,
}

/// Stand-in for a real filter; only its name matters here.
struct Placeholder {
    name: String,
}

#[async_trait]
impl Filter for Placeholder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_filter(&self, invocation: Arc<Invocation>, next: FilterNode) -> FilterResult {
        next.on_filter(invocation).await
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config: FilterChainsConfig = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FilterChainsConfig::default(),
    };

    let registry = FilterRegistry::new();
    for name in &cli.filters {
        registry.register(FilterRegistration::shared(Placeholder { name: name.clone() }))?;
    }

    let mut microservices: BTreeSet<String> = cli.microservice.iter().cloned().collect();
    if microservices.is_empty() {
        microservices.extend(config.consumer.microservices.keys().cloned());
        microservices.extend(config.producer.microservices.keys().cloned());
        microservices.insert("default".to_string());
    }

    let manager = FilterChainsManager::new(Arc::new(registry), config);
    let mut failed = false;
    for invocation_type in [InvocationType::Consumer, InvocationType::Producer] {
        println!("{invocation_type}:");
        for microservice in &microservices {
            match manager.chain_for(invocation_type, microservice) {
                Ok(chain) => println!("  {microservice}: {}", chain.describe()),
                Err(err) => {
                    failed = true;
                    println!("  {microservice}: error: {err}");
                }
            }
        }
    }

    if failed {
        anyhow::bail!("some chains could not be built");
    }
    Ok(())
}
