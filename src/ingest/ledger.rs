//! HTTP client for the TzKT-compatible ledger query API
//!
//! Every request goes through [`LedgerClient::get_json`], which applies the
//! shared [`RetryPolicy`]: transient statuses and transport failures are
//! retried with backoff (or the server's `Retry-After`), anything else is
//! surfaced to the caller as a [`FetchError`].

use crate::config::{ColdStart, SyncConfig};
use crate::ingest::contracts::{MarketRegistry, COLLECT_ENTRYPOINT};
use crate::ingest::retry::{is_transient, parse_retry_after, RetryPolicy};
use crate::ingest::types::{EventPage, OperationId, RawEvent, TokenInfo, TraceOperation, TransferRecord};
use chrono::Utc;
use log::{debug, warn};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

const EVENT_FIELDS: &str = "id,hash,level,sender,target,amount,parameter,timestamp";
const TRANSFER_FIELDS: &str = "id,level,to,token,transactionId,timestamp";
const TOKEN_FIELDS: &str = "metadata,firstMinter";

/// Upper bound on rows per transfer query (API maximum)
const TRANSFER_PAGE_LIMIT: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: StatusCode, url: String },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Gave up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
        /// Status of the final attempt; `None` for a transport failure
        status: Option<StatusCode>,
    },
}

impl FetchError {
    /// True when the final failure was the server throttling us
    pub fn is_rate_limited(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
            FetchError::RetriesExhausted { status, .. } => *status == Some(StatusCode::TOO_MANY_REQUESTS),
            _ => false,
        }
    }
}

pub struct LedgerClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
    markets: MarketRegistry,
}

impl LedgerClient {
    pub fn new(config: &SyncConfig) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("trustflow/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            retry: config.retry,
            markets: MarketRegistry::new(config.markets.clone()),
        })
    }

    pub fn markets(&self) -> &MarketRegistry {
        &self.markets
    }

    /// GET `path` with `query`, retrying transient failures
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            let (reason, last_status, hint) = match self.http.get(&url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.bytes().await?;
                        return serde_json::from_slice(&body)
                            .map_err(|source| FetchError::Decode { url: url.clone(), source });
                    }

                    if !is_transient(status) {
                        return Err(FetchError::Status { status, url });
                    }

                    let hint = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| parse_retry_after(v, Utc::now()));
                    (format!("HTTP {}", status.as_u16()), Some(status), hint)
                }
                Err(e) => (e.to_string(), None, None),
            };

            if !self.retry.should_retry(attempt) {
                return Err(FetchError::RetriesExhausted {
                    url,
                    attempts: attempt + 1,
                    last: reason,
                    status: last_status,
                });
            }

            let delay = self.retry.delay_for(attempt, hint);
            warn!(
                "⚠️  {} from {} (attempt {}/{}), retrying in {:?}",
                reason,
                path,
                attempt + 1,
                self.retry.max_attempts(),
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Settlement events with `id > cursor`, ascending by id
    pub async fn fetch_batch(&self, cursor: i64, limit: usize) -> Result<EventPage, FetchError> {
        let rows: Vec<Value> = self
            .get_json(
                "/v1/operations/transactions",
                &[
                    ("target.in", self.markets.target_filter()),
                    ("entrypoint", COLLECT_ENTRYPOINT.to_string()),
                    ("status", "applied".to_string()),
                    ("sort.asc", "id".to_string()),
                    ("id.gt", cursor.to_string()),
                    ("limit", limit.to_string()),
                    ("select", EVENT_FIELDS.to_string()),
                ],
            )
            .await?;

        let mut page = EventPage::default();
        for row in rows {
            if let Some(id) = row.get("id").and_then(Value::as_i64) {
                page.high_water = Some(page.high_water.map_or(id, |hw| hw.max(id)));
            }
            match serde_json::from_value::<RawEvent>(row) {
                Ok(event) => page.events.push(event),
                Err(e) => {
                    warn!("⚠️  Skipping malformed event: {}", e);
                    page.skipped += 1;
                }
            }
        }
        page.events.sort_by_key(|e| e.id);

        debug!(
            "Fetched {} events after {} ({} skipped)",
            page.events.len(),
            cursor,
            page.skipped
        );
        Ok(page)
    }

    /// Find a starting cursor with a single limit-1 query
    ///
    /// `None` means there is nothing relevant upstream yet.
    pub async fn discover_start(&self, mode: ColdStart) -> Result<Option<i64>, FetchError> {
        let sort = match mode {
            ColdStart::Genesis => "sort.asc",
            ColdStart::Tip => "sort.desc",
        };

        let rows: Vec<OperationId> = self
            .get_json(
                "/v1/operations/transactions",
                &[
                    ("target.in", self.markets.target_filter()),
                    ("entrypoint", COLLECT_ENTRYPOINT.to_string()),
                    ("status", "applied".to_string()),
                    (sort, "id".to_string()),
                    ("limit", "1".to_string()),
                    ("select.fields", "id".to_string()),
                ],
            )
            .await?;

        Ok(rows.first().map(|op| match mode {
            ColdStart::Genesis => op.id - 1,
            ColdStart::Tip => op.id,
        }))
    }

    /// All operations of one transaction group
    pub async fn fetch_trace(&self, hash: &str) -> Result<Vec<TraceOperation>, FetchError> {
        self.get_json(&format!("/v1/operations/{}", hash), &[]).await
    }

    /// Token transfers produced by any of `operation_ids`
    pub async fn fetch_transfers(&self, operation_ids: &[i64]) -> Result<Vec<TransferRecord>, FetchError> {
        if operation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = operation_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let joined = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");

        let rows: Vec<Value> = self
            .get_json(
                "/v1/tokens/transfers",
                &[
                    ("transactionId.in", joined),
                    ("select", TRANSFER_FIELDS.to_string()),
                    ("limit", TRANSFER_PAGE_LIMIT.to_string()),
                ],
            )
            .await?;

        Ok(decode_transfers(rows))
    }

    /// Token transfers included in block `level`
    pub async fn fetch_transfers_at_level(&self, level: i64) -> Result<Vec<TransferRecord>, FetchError> {
        let rows: Vec<Value> = self
            .get_json(
                "/v1/tokens/transfers",
                &[
                    ("level", level.to_string()),
                    ("select", TRANSFER_FIELDS.to_string()),
                    ("limit", TRANSFER_PAGE_LIMIT.to_string()),
                ],
            )
            .await?;

        Ok(decode_transfers(rows))
    }

    pub async fn fetch_token(&self, contract: &str, token_id: &str) -> Result<Option<TokenInfo>, FetchError> {
        let rows: Vec<TokenInfo> = self
            .get_json(
                "/v1/tokens",
                &[
                    ("contract", contract.to_string()),
                    ("tokenId", token_id.to_string()),
                    ("select", TOKEN_FIELDS.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        Ok(rows.into_iter().next())
    }
}

fn decode_transfers(rows: Vec<Value>) -> Vec<TransferRecord> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<TransferRecord>(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("⚠️  Skipping malformed transfer: {}", e);
                None
            }
        })
        .collect()
}
