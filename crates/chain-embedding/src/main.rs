//! Service Chain Embedding CLI
//!
//! Embeds the request of a scenario file onto its substrate.
//!
//! Usage:
//!   embed-chains --scenario data/line_chain.json \
//!                --output data/line_chain_mapping.json

use anyhow::Result;
use chain_embedding::{map_request, scenario, EmbedError, MappingConfig};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "embed-chains",
    about = "Latency-aware service chain embedding with bounded backtracking"
)]
struct Args {
    /// Path to scenario JSON file
    #[arg(short, long, default_value = "data/line_chain.json")]
    scenario: PathBuf,

    /// Mapping config JSON file; overrides the scenario's own config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of subchain levels kept for backtracking
    #[arg(long)]
    bt_limit: Option<usize>,

    /// Maximum number of alternatives kept per level
    #[arg(long)]
    branching_factor: Option<usize>,

    /// Output JSON file; prints to stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{}", "=".repeat(60));
    info!("Service Chain Embedding");
    info!("{}", "=".repeat(60));

    let loaded = scenario::load_scenario(&args.scenario)?;
    let mut config = match &args.config {
        Some(path) => MappingConfig::from_json_file(path)?,
        None => loaded.config.clone().unwrap_or_default(),
    };
    if let Some(n) = args.bt_limit {
        config = config.bt_limit(n);
    }
    if let Some(n) = args.branching_factor {
        config = config.branching_factor(n);
    }
    info!(
        "bt_limit={} branching_factor={}",
        config.bt_limit, config.branching_factor
    );

    let result = match map_request(loaded.substrate, loaded.request, config) {
        Ok(result) => result,
        Err(EmbedError::Mapping {
            message,
            peak_vnf_cnt,
            peak_sc_cnt,
            ..
        }) => {
            warn!("Request cannot be embedded: {}", message);
            warn!(
                "Deepest progress: {} VNFs, {} subchains",
                peak_vnf_cnt.unwrap_or(0),
                peak_sc_cnt.unwrap_or(0)
            );
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    match &args.output {
        Some(path) => {
            info!("Writing mapping to {:?}", path);
            let file = File::create(path)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, &result)?;
        }
        None => println!("{}", serde_json::to_string_pretty(&result)?),
    }

    info!("{}", "=".repeat(60));
    info!("SUMMARY");
    info!("{}", "=".repeat(60));
    for placement in &result.vnf_mapping {
        info!("  {} -> {}", placement.vnf, placement.host);
    }
    for chain in &result.chain_latency {
        info!(
            "  chain {}: {} of {} latency left",
            chain.chain, chain.remaining, chain.budget
        );
    }
    info!("Backtracks: {}", result.backtracks);

    Ok(())
}
