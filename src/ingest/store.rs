//! SQLite persistence for trades, edges, the cursor and the writer lease
//!
//! Tables (see `/sql/`):
//! - `trades` - INSERT OR IGNORE, primary key is the fact dedupe key
//! - `edges` - UPSERT on (source, target), only when the trade row was new
//! - `state` - cursor values, see [`crate::ingest::cursor`]
//! - `sync_lease` - single-writer heartbeat lease
//! - `scores`, `scores_staging`, `score_generations` - written by the publisher

use crate::ingest::graph::{edge_weight, Edge};
use crate::ingest::types::ResolvedTransfer;
use crate::sqlite_pragma::apply_optimized_pragmas;
use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Schema files in application order
const SCHEMA: &[(&str, &str)] = &[
    ("00_state.sql", include_str!("../../sql/00_state.sql")),
    ("01_trades.sql", include_str!("../../sql/01_trades.sql")),
    ("02_edges.sql", include_str!("../../sql/02_edges.sql")),
    ("03_sync_lease.sql", include_str!("../../sql/03_sync_lease.sql")),
    ("04_scores.sql", include_str!("../../sql/04_scores.sql")),
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to create database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Writer lease is held by {owner} (last heartbeat {heartbeat})")]
    WriterLocked { owner: String, heartbeat: i64 },

    #[error("Writer lease for {0} was lost")]
    LeaseLost(String),
}

/// Result of merging one batch of facts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub self_edges: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub edge_count: i64,
    pub trade_count: i64,
    pub scored_count: i64,
    pub generation: Option<i64>,
}

/// Apply the embedded schema. Every statement is `IF NOT EXISTS`.
pub fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    for (name, sql) in SCHEMA {
        debug!("   ├─ Applying {}", name);
        conn.execute_batch(sql)?;
    }
    Ok(())
}

/// Handle to the trust database; clones share one connection
#[derive(Clone)]
pub struct TrustStore {
    conn: Arc<Mutex<Connection>>,
    volume_scale: f64,
}

impl TrustStore {
    pub fn open(db_path: impl AsRef<Path>, volume_scale: f64) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        apply_schema(&conn)?;

        info!("✅ Trust store ready: {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            volume_scale,
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge a batch of facts in one transaction.
    ///
    /// A fact whose dedupe key is already in `trades` leaves its edge untouched,
    /// so replaying a batch is a no-op.
    pub fn ingest_transfers(&self, transfers: &[ResolvedTransfer]) -> Result<IngestSummary, StoreError> {
        let mut summary = IngestSummary::default();
        if transfers.is_empty() {
            return Ok(summary);
        }

        let now = Utc::now().timestamp();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        {
            let mut insert_trade = tx.prepare_cached(
                "INSERT OR IGNORE INTO trades
                 (source, target, contract, token_id, event_id, amount_paid, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let mut read_edge = tx.prepare_cached(
                "SELECT trade_count, volume FROM edges WHERE source = ?1 AND target = ?2",
            )?;
            let mut upsert_edge = tx.prepare_cached(
                "INSERT INTO edges (source, target, trade_count, volume, weight, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(source, target) DO UPDATE SET
                    trade_count = excluded.trade_count,
                    volume = excluded.volume,
                    weight = excluded.weight,
                    updated_at = excluded.updated_at",
            )?;

            for t in transfers {
                if t.buyer == t.counterparty {
                    summary.self_edges += 1;
                    continue;
                }

                let amount = t.amount_paid.max(0);
                let inserted = insert_trade.execute(params![
                    t.buyer,
                    t.counterparty,
                    t.token.contract,
                    t.token.token_id,
                    t.event_id,
                    amount,
                    t.timestamp.timestamp(),
                ])?;
                if inserted == 0 {
                    summary.duplicates += 1;
                    continue;
                }

                let (count, volume): (i64, i64) = read_edge
                    .query_row(params![t.buyer, t.counterparty], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?
                    .unwrap_or((0, 0));
                let count = count + 1;
                let volume = volume.saturating_add(amount);

                upsert_edge.execute(params![
                    t.buyer,
                    t.counterparty,
                    count,
                    volume,
                    edge_weight(count as u64, volume, self.volume_scale),
                    now,
                ])?;
                summary.inserted += 1;
            }
        }

        tx.commit()?;
        debug!(
            "✅ Merged {} facts ({} duplicates)",
            summary.inserted, summary.duplicates
        );
        Ok(summary)
    }

    /// Snapshot of every edge, ordered by (source, target)
    pub fn load_edges(&self) -> Result<Vec<Edge>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source, target, trade_count, volume, weight FROM edges ORDER BY source, target",
        )?;
        let edges = stmt
            .query_map([], |row| {
                Ok(Edge {
                    source: row.get(0)?,
                    target: row.get(1)?,
                    trade_count: row.get::<_, i64>(2)?.max(0) as u64,
                    volume: row.get(3)?,
                    weight: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn();
        let count = |sql: &str| -> Result<i64, rusqlite::Error> { conn.query_row(sql, [], |row| row.get(0)) };

        Ok(StoreStats {
            edge_count: count("SELECT COUNT(*) FROM edges")?,
            trade_count: count("SELECT COUNT(*) FROM trades")?,
            scored_count: count("SELECT COUNT(*) FROM scores")?,
            generation: conn.query_row("SELECT MAX(id) FROM score_generations", [], |row| row.get(0))?,
        })
    }

    /// Claim the single writer lease.
    ///
    /// Succeeds when no lease exists, `owner` already holds it, or the holder's
    /// heartbeat is older than `lease_secs`.
    pub fn acquire_writer_lease(&self, owner: &str, now: i64, lease_secs: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, i64)> = tx
            .query_row("SELECT owner, heartbeat FROM sync_lease WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        if let Some((holder, heartbeat)) = current {
            if holder != owner && now - heartbeat < lease_secs {
                return Err(StoreError::WriterLocked {
                    owner: holder,
                    heartbeat,
                });
            }
            if holder != owner {
                info!("⚠️  Taking over stale lease from {} (heartbeat {})", holder, heartbeat);
            }
        }

        tx.execute(
            "INSERT INTO sync_lease (id, owner, heartbeat) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET owner = excluded.owner, heartbeat = excluded.heartbeat",
            params![owner, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn renew_writer_lease(&self, owner: &str, now: i64) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE sync_lease SET heartbeat = ?2 WHERE id = 1 AND owner = ?1",
            params![owner, now],
        )?;
        if updated == 0 {
            return Err(StoreError::LeaseLost(owner.to_string()));
        }
        Ok(())
    }

    pub fn release_writer_lease(&self, owner: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM sync_lease WHERE id = 1 AND owner = ?1",
            params![owner],
        )?;
        Ok(())
    }
}
