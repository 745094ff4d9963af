//! Trust Sync - ledger ingestion loop
//!
//! Pulls marketplace settlement events newer than the committed cursor,
//! resolves them into buyer -> creator facts and merges them into the edge
//! table. Safe to stop at any point; the next start resumes from the cursor.
//!
//! Usage:
//!   cargo run --release --bin trust_sync
//!   cargo run --release --bin trust_sync -- --once
//!
//! Configuration comes from the environment (see `TrustConfig::from_env`).

use clap::Parser;
use dotenv::dotenv;
use log::{error, info};
use trustflow::ingest::{CycleOutcome, StoreError, SyncEngine, TrustStore};
use trustflow::TrustConfig;

#[derive(Parser, Debug)]
#[command(name = "trust_sync", about = "Incremental trust graph ingestion")]
struct Args {
    /// SQLite database path (overrides TRUST_DB_PATH)
    #[arg(long, env = "TRUST_DB_PATH")]
    db: Option<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
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

    info!("🚀 Trust Sync");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Ledger API: {}", config.sync.api_url);
    info!("   ├─ Markets: {}", config.sync.markets.len());
    info!("   ├─ Cold start: {:?}", config.sync.cold_start);
    info!("   └─ Level fallback: {}", config.sync.accept_level_fallback);

    info!("🔧 Opening database...");
    let store = TrustStore::open(&config.db_path, config.scoring.volume_scale)?;
    let mut engine = SyncEngine::new(config.sync.clone(), store)?;

    match engine.acquire_lease() {
        Ok(()) => info!("✅ Writer lease acquired ({})", engine.owner()),
        Err(StoreError::WriterLocked { owner, heartbeat }) => {
            error!("❌ Another sync is running: {} (heartbeat {})", owner, heartbeat);
            return Err(StoreError::WriterLocked { owner, heartbeat }.into());
        }
        Err(e) => return Err(e.into()),
    }

    if args.once {
        let outcome = engine.run_cycle().await;
        engine.release_lease()?;
        match outcome? {
            CycleOutcome::CaughtUp { cursor } => info!("✅ Caught up (cursor {:?})", cursor),
            CycleOutcome::Advanced { from, to, .. } => info!("✅ Advanced {} → {}", from, to),
        }
        return Ok(());
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");

    let result = tokio::select! {
        result = engine.run() => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("");
                    info!("⚠️  Received CTRL+C, shutting down...");
                }
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
            Ok(())
        }
    };

    if let Err(e) = engine.release_lease() {
        error!("❌ Failed to release writer lease: {}", e);
    }
    engine.log_stats();

    match result {
        Ok(()) => {
            info!("✅ Trust sync stopped");
            Ok(())
        }
        Err(e) => {
            error!("❌ Sync loop failed: {}", e);
            Err(e.into())
        }
    }
}
