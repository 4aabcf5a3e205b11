//! kadmesh-sim - run a simulated Kademlia network

use anyhow::Result;
use clap::Parser;
use kadmesh_sim::{SimConfig, Simulation};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kadmesh-sim")]
#[command(about = "Simulate a Kademlia network in memory and measure lookups")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the default configuration to --config and exit
    #[arg(long, requires = "config")]
    init: bool,

    /// Override network.nodes
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Override workload.lookups
    #[arg(short, long)]
    lookups: Option<usize>,

    /// Override network.seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.init {
        if let Some(path) = &args.config {
            SimConfig::default().save(path)?;
            info!("Configuration written to {}", path.display());
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    if let Some(nodes) = args.nodes {
        config.network.nodes = nodes;
    }
    if let Some(lookups) = args.lookups {
        config.workload.lookups = lookups;
    }
    if let Some(seed) = args.seed {
        config.network.seed = seed;
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl+C, stopping simulation");
                cancel.cancel();
            }
        }
    });

    let simulation = Simulation::build(config)?;
    let report = simulation.run(&cancel).await?;

    println!("nodes:            {}", report.bootstrap.nodes);
    println!("mean table size:  {:.1}", report.bootstrap.mean_table_size);
    println!("offline:          {}", report.offline);
    println!("lookups:          {}", report.lookups.lookups);
    println!("  exact closest:  {}", report.lookups.exact);
    println!("  mean overlap:   {:.2}", report.lookups.mean_overlap);
    println!("  mean queries:   {:.1}", report.lookups.mean_queries);
    println!("  failures:       {}", report.lookups.failures);
    println!("discovery walks:  {}", report.discovery.walks);
    println!("  discovered:     {}", report.discovery.discovered);
    println!("messages:         {} delivered, {} dropped", report.delivered, report.dropped);

    Ok(())
}
