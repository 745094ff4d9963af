//! Durable ingestion progress
//!
//! One integer per named key. The sync loop is the only writer and only ever
//! moves a key forward, after the work below it has been committed.

use crate::ingest::store::{StoreError, TrustStore};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

/// Highest settlement event id whose facts are committed
pub const CURSOR_KEY: &str = "last_event_id";

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Durable upsert, last writer wins
    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError>;
}

#[async_trait]
impl CursorStore for TrustStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let value = self
            .conn()
            .query_row("SELECT value FROM state WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().timestamp()],
        )?;
        Ok(())
    }
}
