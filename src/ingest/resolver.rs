//! Trace resolution: settlement events to (buyer, counterparty, token) facts
//!
//! A `collect` call is only the entry point of a transaction group; the token
//! actually moves in an internal operation. For a batch of events we:
//! 1. fetch every operation of each distinct group hash (bounded chunks, bounded parallelism)
//! 2. fetch token transfers for all those operation ids in bulk
//! 3. attribute each transfer back to the event that owns its group
//! 4. resolve the token's canonical creator as the counterparty
//!
//! The buyer of a fact is the transfer's recipient. The owning event only
//! supplies the event id and the amount paid.

use crate::config::SyncConfig;
use crate::ingest::cache::BoundedCache;
use crate::ingest::ledger::{FetchError, LedgerClient};
use crate::ingest::types::{RawEvent, ResolvedTransfer, TokenInfo, TokenMetadata, TokenRef, TransferRecord};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Counterparty precedence: `firstMinter`, then `creators[0]`, then `issuer`.
/// Metadata embedded in the transfer record is the last resort.
pub fn canonical_creator(info: Option<&TokenInfo>, embedded: Option<&TokenMetadata>) -> Option<String> {
    info.and_then(|i| i.first_minter.as_ref())
        .and_then(|a| a.as_address())
        .map(str::to_string)
        .or_else(|| info.and_then(|i| i.metadata.as_ref()).and_then(TokenMetadata::declared_creator))
        .or_else(|| embedded.and_then(TokenMetadata::declared_creator))
}

/// Outcome of resolving one batch of events
#[derive(Debug, Default)]
pub struct ResolvedBatch {
    pub transfers: Vec<ResolvedTransfer>,
    pub malformed: usize,
    pub unresolved: usize,
    pub self_transfers: usize,
    pub unlinked: usize,
    pub fallback_matches: usize,
}

pub struct TraceResolver {
    client: Arc<LedgerClient>,
    creators: BoundedCache<TokenRef, Option<String>>,
    trace_chunk_size: usize,
    transfer_chunk_size: usize,
    concurrency: usize,
    accept_level_fallback: bool,
}

impl TraceResolver {
    pub fn new(client: Arc<LedgerClient>, config: &SyncConfig) -> Self {
        Self {
            client,
            creators: BoundedCache::new(config.creator_cache_capacity),
            trace_chunk_size: config.trace_chunk_size.max(1),
            transfer_chunk_size: config.transfer_chunk_size.max(1),
            concurrency: config.fetch_concurrency.max(1),
            accept_level_fallback: config.accept_level_fallback,
        }
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        self.creators.stats()
    }

    /// Resolve a batch. Any fetch error that survives retries fails the
    /// whole batch so the caller can defer it without moving the cursor.
    pub async fn resolve(&mut self, events: &[RawEvent]) -> Result<ResolvedBatch, FetchError> {
        let mut batch = ResolvedBatch::default();

        // Group well-formed events by transaction hash, keeping first-seen order
        let mut hashes: Vec<String> = Vec::new();
        let mut by_hash: HashMap<String, Vec<&RawEvent>> = HashMap::new();
        for event in events {
            if let Err(reason) = self.check_event(event) {
                warn!("⚠️  Skipping event {} ({}): {}", event.id, event.hash, reason);
                batch.malformed += 1;
                continue;
            }
            by_hash
                .entry(event.hash.clone())
                .or_insert_with(|| {
                    hashes.push(event.hash.clone());
                    Vec::new()
                })
                .push(event);
        }

        if hashes.is_empty() {
            return Ok(batch);
        }

        let op_to_hash = self.fetch_traces(&hashes).await?;
        let op_ids: Vec<i64> = op_to_hash.keys().copied().collect();
        let records = self.fetch_transfers(&op_ids).await?;

        // Attribute each transfer to the event that owns its group
        let mut linked: HashMap<i64, Vec<TransferRecord>> = HashMap::new();
        for record in records {
            let Some(hash) = record.transaction_id.and_then(|id| op_to_hash.get(&id)) else {
                continue;
            };
            let Some(candidates) = by_hash.get(hash) else {
                continue;
            };
            let owner = candidates
                .iter()
                .find(|e| e.buyer().is_some() && e.buyer() == record.recipient())
                .or_else(|| candidates.first());
            if let Some(owner) = owner {
                linked.entry(owner.id).or_default().push(record);
            }
        }

        // Events with no linked transfer get a same-level search
        let mut level_cache: HashMap<i64, Vec<TransferRecord>> = HashMap::new();
        for event in by_hash.values().flatten() {
            if linked.contains_key(&event.id) {
                continue;
            }
            batch.unlinked += 1;

            let matches = self.search_level(event, &mut level_cache).await?;
            if matches.is_empty() {
                debug!("No transfer found for event {} ({})", event.id, event.hash);
                continue;
            }

            batch.fallback_matches += 1;
            info!(
                "🔎 Level fallback: event {} ({}) matches {} transfer(s) at level {}{}",
                event.id,
                event.hash,
                matches.len(),
                event.level,
                if self.accept_level_fallback { "" } else { " (diagnostic only)" }
            );
            if self.accept_level_fallback {
                linked.insert(event.id, matches);
            }
        }

        let creators = self.resolve_creators(linked.values().flatten()).await?;

        let event_index: HashMap<i64, &RawEvent> =
            by_hash.values().flatten().map(|e| (e.id, *e)).collect();
        let mut seen = HashSet::new();

        for (event_id, records) in &linked {
            let Some(event) = event_index.get(event_id) else {
                continue;
            };

            for record in records {
                let Some(buyer) = record.recipient() else {
                    warn!("⚠️  Skipping transfer {} without a recipient", record.id);
                    batch.malformed += 1;
                    continue;
                };
                let Some(token) = record.token_ref() else {
                    warn!("⚠️  Skipping transfer {} without a token contract", record.id);
                    batch.malformed += 1;
                    continue;
                };

                let counterparty = creators
                    .get(&token)
                    .cloned()
                    .flatten()
                    .or_else(|| canonical_creator(None, record.token.metadata.as_ref()));

                let Some(counterparty) = counterparty else {
                    debug!(
                        "Unresolved counterparty for {}:{} (event {})",
                        token.contract, token.token_id, event.id
                    );
                    batch.unresolved += 1;
                    continue;
                };

                if counterparty == buyer {
                    debug!("Dropping self-transfer by {} (event {})", buyer, event.id);
                    batch.self_transfers += 1;
                    continue;
                }

                let fact = ResolvedTransfer {
                    event_id: event.id,
                    buyer: buyer.to_string(),
                    counterparty,
                    token,
                    amount_paid: event.amount,
                    timestamp: event.timestamp,
                };
                if seen.insert(fact.dedupe_key()) {
                    batch.transfers.push(fact);
                }
            }
        }

        batch.transfers.sort_by(|a, b| {
            a.event_id
                .cmp(&b.event_id)
                .then_with(|| a.token.cmp(&b.token))
                .then_with(|| a.counterparty.cmp(&b.counterparty))
        });
        Ok(batch)
    }

    fn check_event(&self, event: &RawEvent) -> Result<(), String> {
        if event.buyer().is_none() {
            return Err("missing sender".to_string());
        }
        let market = event.market().ok_or("missing target")?;
        let version = self
            .client
            .markets()
            .version_of(market)
            .ok_or_else(|| format!("unknown market {}", market))?;
        let parameter = event.parameter.as_ref().ok_or("missing parameter")?;
        if parameter.entrypoint != crate::ingest::contracts::COLLECT_ENTRYPOINT {
            return Err(format!("unexpected entrypoint {}", parameter.entrypoint));
        }
        version
            .parse_collect(&parameter.value)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Operation id -> owning group hash for every hash in the batch
    async fn fetch_traces(&self, hashes: &[String]) -> Result<HashMap<i64, String>, FetchError> {
        let client = &self.client;
        let mut op_to_hash = HashMap::new();

        for chunk in hashes.chunks(self.trace_chunk_size) {
            let results: Vec<_> = stream::iter(chunk)
                .map(|hash| async move { (hash, client.fetch_trace(hash).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for (hash, result) in results {
                for op in result? {
                    op_to_hash.insert(op.id, hash.clone());
                }
            }
        }

        debug!("Traced {} groups into {} operations", hashes.len(), op_to_hash.len());
        Ok(op_to_hash)
    }

    async fn fetch_transfers(&self, op_ids: &[i64]) -> Result<Vec<TransferRecord>, FetchError> {
        let mut ids = op_ids.to_vec();
        ids.sort_unstable();

        let client = &self.client;
        let results: Vec<_> = stream::iter(ids.chunks(self.transfer_chunk_size))
            .map(|chunk| client.fetch_transfers(chunk))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut records = Vec::new();
        for result in results {
            records.extend(result?);
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Transfers at the event's level whose recipient is the buyer
    async fn search_level(
        &self,
        event: &RawEvent,
        level_cache: &mut HashMap<i64, Vec<TransferRecord>>,
    ) -> Result<Vec<TransferRecord>, FetchError> {
        if event.level <= 0 {
            return Ok(Vec::new());
        }

        if !level_cache.contains_key(&event.level) {
            let records = match self.client.fetch_transfers_at_level(event.level).await {
                Ok(records) => records,
                // The search only feeds a diagnostic unless facts are accepted from it
                Err(e) if !self.accept_level_fallback => {
                    warn!("⚠️  Level search at {} failed: {}", event.level, e);
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            level_cache.insert(event.level, records);
        }

        let buyer = event.buyer();
        Ok(level_cache
            .get(&event.level)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| buyer.is_some() && r.recipient() == buyer)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Canonical creator per token, from the cache or a token lookup.
    ///
    /// A failed lookup fails the batch. Embedded metadata is only consulted by
    /// the caller when the lookup succeeded without naming a creator.
    async fn resolve_creators<'a>(
        &mut self,
        records: impl Iterator<Item = &'a TransferRecord>,
    ) -> Result<HashMap<TokenRef, Option<String>>, FetchError> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();

        for token in records.filter_map(TransferRecord::token_ref) {
            if resolved.contains_key(&token) || missing.contains(&token) {
                continue;
            }
            match self.creators.get(&token) {
                Some(creator) => {
                    resolved.insert(token, creator);
                }
                None => missing.push(token),
            }
        }

        if missing.is_empty() {
            return Ok(resolved);
        }

        let client = Arc::clone(&self.client);
        let lookups: Vec<_> = stream::iter(missing)
            .map(|token| {
                let client = &client;
                async move {
                    let result = client.fetch_token(&token.contract, &token.token_id).await;
                    (token, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (token, result) in lookups {
            let info = result.map_err(|e| {
                warn!("⚠️  Token lookup for {}:{} failed: {}", token.contract, token.token_id, e);
                e
            })?;
            let creator = canonical_creator(info.as_ref(), None);
            self.creators.insert(token.clone(), creator.clone());
            resolved.insert(token, creator);
        }

        Ok(resolved)
    }
}
