//! collab-sim: Runs several in-process collaboration sessions with random
//! concurrent edits and checks that they converge.

use anyhow::Result;
use clap::Parser;
use collab_core::DesyncPolicy;
use collab_sim::{SimConfig, Simulator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-sim")]
#[command(about = "Randomized convergence simulator for collab-core")]
struct Args {
    /// Number of collaborating peers
    #[arg(short, long, default_value_t = 3)]
    peers: usize,

    /// Number of edit rounds
    #[arg(short, long, default_value_t = 20)]
    rounds: usize,

    /// Edits each peer makes per round
    #[arg(short, long, default_value_t = 3)]
    edits: usize,

    /// Seed for the random edit and delivery schedule (random if not provided)
    #[arg(long)]
    seed: Option<u64>,

    /// Rebuild a peer's document from the shared tree on divergence instead
    /// of failing
    #[arg(long)]
    resync: bool,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_core=debug,collab_sim=debug"
    } else {
        "info,collab_core=warn,collab_sim=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("Starting collab-sim with {} peers, seed {}", args.peers, seed);

    let config = SimConfig {
        peers: args.peers,
        rounds: args.rounds,
        edits_per_round: args.edits,
        seed,
        desync_policy: if args.resync {
            DesyncPolicy::Resync
        } else {
            DesyncPolicy::Fail
        },
    };
    let report = Simulator::new(config)?.run()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Converged: {} peers, {} edits, {} messages ({} bytes), {} nodes",
            report.peers, report.edits, report.messages, report.bytes, report.nodes
        );
    }
    Ok(())
}
