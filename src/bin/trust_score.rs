//! Trust Score - global scoring pass and personalized queries
//!
//! Loads the current edge snapshot, computes global PageRank and publishes it
//! as a new generation, then prints a JSON report to stdout. With
//! `--ppr <address>` it also prints scores personalized to that address
//! (computed on demand, not stored).
//!
//! Usage:
//!   cargo run --release --bin trust_score
//!   cargo run --release --bin trust_score -- --ppr tz1... --skip-global

use clap::Parser;
use dotenv::dotenv;
use log::{error, info};
use serde::Serialize;
use trustflow::ingest::TrustStore;
use trustflow::scoring::{PublishedScore, RankedScore, ScoringJob, ScoringReport};
use trustflow::TrustConfig;

#[derive(Parser, Debug)]
#[command(name = "trust_score", about = "Compute and publish trust scores")]
struct Args {
    /// SQLite database path (overrides TRUST_DB_PATH)
    #[arg(long, env = "TRUST_DB_PATH")]
    db: Option<String>,

    /// Also compute scores personalized to this address
    #[arg(long, value_name = "ADDRESS")]
    ppr: Option<String>,

    /// Do not run or publish the global pass
    #[arg(long)]
    skip_global: bool,

    /// Number of entries to print per list
    #[arg(long, default_value_t = 20)]
    top: usize,
}

#[derive(Serialize)]
struct Output {
    #[serde(skip_serializing_if = "Option::is_none")]
    global: Option<ScoringReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    top: Vec<PublishedScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    personalized: Option<Personalized>,
    edges: i64,
    trades: i64,
    scored: i64,
}

#[derive(Serialize)]
struct Personalized {
    seed: String,
    scores: Vec<RankedScore>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match TrustConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    if let Some(db) = args.db {
        config.db_path = db;
    }

    info!("🚀 Trust Score");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Alpha: {}", config.scoring.alpha);
    info!("   ├─ Tolerance: {:e}", config.scoring.tolerance);
    info!("   └─ Max iterations: {}", config.scoring.max_iterations);

    let store = TrustStore::open(&config.db_path, config.scoring.volume_scale)?;
    let job = ScoringJob::new(store.clone(), config.scoring);

    let global = if args.skip_global {
        None
    } else {
        job.run_global()?
    };

    let personalized = match args.ppr {
        Some(seed) => {
            let mut scores = job.personalized(&seed)?;
            if scores.is_empty() {
                info!("⚠️  {} has no edges in the graph", seed);
            }
            scores.truncate(args.top);
            Some(Personalized { seed, scores })
        }
        None => None,
    };

    let stats = store.stats()?;
    let output = Output {
        global,
        top: job.publisher().top(args.top)?,
        personalized,
        edges: stats.edge_count,
        trades: stats.trade_count,
        scored: stats.scored_count,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
