//! Atomic replacement of the published score set
//!
//! A publish is one IMMEDIATE transaction that:
//! 1. fills `scores_staging` with the new rows
//! 2. records a `score_generations` row
//! 3. swaps `scores` for the staged rows stamped with that generation
//! 4. clears staging
//!
//! The write lock is held from the first staged row to the commit, so two
//! overlapping publishers cannot interleave on the staging table. Readers of
//! `scores` see either the old generation or the new one, never a mix. Any
//! failure rolls the whole transaction back and the old generation stays.

use crate::ingest::store::{StoreError, TrustStore};
use crate::scoring::ranking::RankedScore;
use chrono::Utc;
use log::info;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;

/// Staged rows carry this until the swap stamps the real generation
const PENDING_GENERATION: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedScore {
    pub address: String,
    pub score: f64,
    pub rank: i64,
    pub generation: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub id: i64,
    pub node_count: i64,
    pub iterations: i64,
    pub converged: bool,
    pub published_at: i64,
}

/// Run metadata recorded alongside a generation
#[derive(Debug, Clone, Copy)]
pub struct GenerationMeta {
    pub node_count: usize,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Clone)]
pub struct ScorePublisher {
    store: TrustStore,
}

impl ScorePublisher {
    pub fn new(store: TrustStore) -> Self {
        Self { store }
    }

    /// Publish `scores` as a new generation and return its id
    pub fn publish(&self, scores: &[RankedScore], meta: GenerationMeta) -> Result<i64, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM scores_staging", [])?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO scores_staging (address, score, rank, generation) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for s in scores {
                insert.execute(params![s.address, s.score, s.rank, PENDING_GENERATION])?;
            }
        }

        tx.execute(
            "INSERT INTO score_generations (node_count, iterations, converged, published_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                meta.node_count as i64,
                meta.iterations as i64,
                meta.converged,
                Utc::now().timestamp()
            ],
        )?;
        let generation = tx.last_insert_rowid();

        tx.execute("DELETE FROM scores", [])?;
        tx.execute(
            "INSERT INTO scores (address, score, rank, generation)
             SELECT address, score, rank, ?1 FROM scores_staging",
            params![generation],
        )?;
        tx.execute("DELETE FROM scores_staging", [])?;
        tx.commit()?;

        info!("✅ Published generation {} ({} scores)", generation, scores.len());
        Ok(generation)
    }

    pub fn lookup(&self, address: &str) -> Result<Option<PublishedScore>, StoreError> {
        let score = self
            .store
            .conn()
            .query_row(
                "SELECT address, score, rank, generation FROM scores WHERE address = ?1",
                params![address],
                |row| {
                    Ok(PublishedScore {
                        address: row.get(0)?,
                        score: row.get(1)?,
                        rank: row.get(2)?,
                        generation: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(score)
    }

    /// Scores for every known address in `addresses`, read in one transaction
    pub fn lookup_many(&self, addresses: &[String]) -> Result<Vec<PublishedScore>, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let mut found = Vec::with_capacity(addresses.len());
        {
            let mut stmt = tx.prepare_cached(
                "SELECT address, score, rank, generation FROM scores WHERE address = ?1",
            )?;
            for address in addresses {
                let row = stmt
                    .query_row(params![address], |row| {
                        Ok(PublishedScore {
                            address: row.get(0)?,
                            score: row.get(1)?,
                            rank: row.get(2)?,
                            generation: row.get(3)?,
                        })
                    })
                    .optional()?;
                found.extend(row);
            }
        }
        tx.commit()?;
        Ok(found)
    }

    /// Highest-ranked published scores
    pub fn top(&self, limit: usize) -> Result<Vec<PublishedScore>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT address, score, rank, generation FROM scores ORDER BY rank ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(PublishedScore {
                    address: row.get(0)?,
                    score: row.get(1)?,
                    rank: row.get(2)?,
                    generation: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn current_generation(&self) -> Result<Option<Generation>, StoreError> {
        let generation = self
            .store
            .conn()
            .query_row(
                "SELECT id, node_count, iterations, converged, published_at
                 FROM score_generations ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(Generation {
                        id: row.get(0)?,
                        node_count: row.get(1)?,
                        iterations: row.get(2)?,
                        converged: row.get(3)?,
                        published_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(generation)
    }
}
