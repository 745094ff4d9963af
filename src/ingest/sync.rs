//! Incremental, crash-resumable ingestion loop
//!
//! One cycle: read cursor -> fetch the next page of events -> resolve traces
//! -> merge facts into edges (one transaction) -> advance the cursor.
//!
//! The cursor is written only after the edges commit. A crash or Ctrl-C
//! anywhere in a cycle therefore replays at most that batch, and replays are
//! absorbed by the trade dedupe key.

use crate::config::SyncConfig;
use crate::ingest::cursor::{CursorStore, CURSOR_KEY};
use crate::ingest::ledger::{FetchError, LedgerClient};
use crate::ingest::resolver::TraceResolver;
use crate::ingest::store::{StoreError, TrustStore};
use chrono::Utc;
use log::{info, warn};
use rand::Rng;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing newer than the cursor upstream
    CaughtUp { cursor: Option<i64> },
    /// A batch was merged and the cursor moved from `from` to `to`
    Advanced {
        from: i64,
        to: i64,
        events: usize,
        facts: usize,
        inserted: usize,
    },
}

/// Running totals, logged after each batch
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub cycles: u64,
    pub batches: u64,
    pub events: u64,
    pub facts: u64,
    pub inserted: u64,
    pub deferred: u64,
}

pub struct SyncEngine {
    config: SyncConfig,
    client: Arc<LedgerClient>,
    resolver: TraceResolver,
    store: TrustStore,
    cursor: Arc<dyn CursorStore>,
    owner: String,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, store: TrustStore) -> Result<Self, SyncError> {
        let client = Arc::new(LedgerClient::new(&config)?);
        let resolver = TraceResolver::new(Arc::clone(&client), &config);
        let owner = format!(
            "trust_sync-{}-{:08x}",
            std::process::id(),
            rand::thread_rng().gen::<u32>()
        );

        Ok(Self {
            cursor: Arc::new(store.clone()),
            config,
            client,
            resolver,
            store,
            owner,
            stats: SyncStats::default(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    fn lease_secs(&self) -> i64 {
        self.config.lease.as_secs().max(1) as i64
    }

    pub fn acquire_lease(&self) -> Result<(), StoreError> {
        self.store
            .acquire_writer_lease(&self.owner, Utc::now().timestamp(), self.lease_secs())
    }

    pub fn release_lease(&self) -> Result<(), StoreError> {
        self.store.release_writer_lease(&self.owner)
    }

    /// Committed cursor, or a cold-start position when none exists yet
    async fn starting_cursor(&self) -> Result<Option<i64>, SyncError> {
        if let Some(cursor) = self.cursor.get(CURSOR_KEY).await? {
            return Ok(Some(cursor));
        }

        let start = match self.config.start_cursor {
            Some(explicit) => Some(explicit),
            None => self.client.discover_start(self.config.cold_start).await?,
        };

        if let Some(start) = start {
            info!("🧭 Cold start ({:?}): cursor set to {}", self.config.cold_start, start);
            self.cursor.set(CURSOR_KEY, start).await?;
        }
        Ok(start)
    }

    /// Run one fetch/resolve/merge cycle
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, SyncError> {
        self.stats.cycles += 1;

        let Some(cursor) = self.starting_cursor().await? else {
            return Ok(CycleOutcome::CaughtUp { cursor: None });
        };

        let page = self.client.fetch_batch(cursor, self.config.batch_size).await?;
        let Some(high_water) = page.high_water else {
            return Ok(CycleOutcome::CaughtUp { cursor: Some(cursor) });
        };

        let resolved = self.resolver.resolve(&page.events).await?;
        let summary = self.store.ingest_transfers(&resolved.transfers)?;

        // Never move backwards, even if upstream returns something odd
        let next = high_water.max(cursor);
        if next > cursor {
            self.cursor.set(CURSOR_KEY, next).await?;
        } else {
            warn!("⚠️  Batch after {} did not advance the cursor", cursor);
        }

        self.stats.batches += 1;
        self.stats.events += page.events.len() as u64;
        self.stats.facts += resolved.transfers.len() as u64;
        self.stats.inserted += summary.inserted as u64;

        info!(
            "✅ Batch {} → {}: {} events, {} facts ({} new)",
            cursor,
            next,
            page.events.len(),
            resolved.transfers.len(),
            summary.inserted
        );
        if page.skipped + resolved.malformed + resolved.unresolved + resolved.self_transfers > 0 {
            info!(
                "   └─ skipped: {} malformed, {} unresolved, {} self-transfers, {} unlinked",
                page.skipped + resolved.malformed,
                resolved.unresolved,
                resolved.self_transfers,
                resolved.unlinked
            );
        }

        Ok(CycleOutcome::Advanced {
            from: cursor,
            to: next,
            events: page.events.len(),
            facts: resolved.transfers.len(),
            inserted: summary.inserted,
        })
    }

    /// Loop until a storage error or lease loss.
    ///
    /// Fetch failures defer the batch: the cursor stays put and the same batch
    /// is retried after `error_delay`.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        info!("🚀 Sync loop started (owner {})", self.owner);
        info!("   ├─ Batch size: {}", self.config.batch_size);
        info!("   ├─ Markets: {}", self.client.markets().target_filter());
        info!("   └─ Idle delay: {:?}", self.config.idle_delay);

        loop {
            self.store
                .renew_writer_lease(&self.owner, Utc::now().timestamp())?;

            let delay = match self.run_cycle().await {
                Ok(CycleOutcome::CaughtUp { cursor }) => {
                    log::debug!("Caught up at {:?}, idling", cursor);
                    self.config.idle_delay
                }
                Ok(CycleOutcome::Advanced { .. }) => {
                    if self.stats.batches % 10 == 0 {
                        self.log_stats();
                    }
                    self.config.rate_limit_delay
                }
                Err(SyncError::Fetch(e)) => {
                    self.stats.deferred += 1;
                    warn!("⚠️  Batch deferred, cursor unchanged: {}", e);
                    if e.is_rate_limited() {
                        self.config.error_delay.max(self.config.rate_limit_delay)
                    } else {
                        self.config.error_delay
                    }
                }
                Err(e) => return Err(e),
            };

            tokio::time::sleep(delay).await;
        }
    }

    pub fn log_stats(&self) {
        let (hits, misses) = self.resolver.cache_stats();
        info!("📊 Sync stats:");
        info!("   ├─ Batches: {} ({} deferred)", self.stats.batches, self.stats.deferred);
        info!("   ├─ Events: {}", self.stats.events);
        info!("   ├─ Facts: {} ({} new)", self.stats.facts, self.stats.inserted);
        info!("   └─ Creator cache: {} hits / {} misses", hits, misses);
    }
}
