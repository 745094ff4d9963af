//! Wire models for the ledger API and the resolved facts built from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Address field that the API returns either as a bare string or as an
/// object such as `{"address": "tz1...", "alias": "..."}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AddressLike {
    Plain(String),
    Object {
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        value: Option<String>,
    },
    Other(Value),
}

impl AddressLike {
    pub fn as_address(&self) -> Option<&str> {
        let raw = match self {
            AddressLike::Plain(s) => Some(s.as_str()),
            AddressLike::Object { address, value } => address.as_deref().or(value.as_deref()),
            AddressLike::Other(_) => None,
        }?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventParameter {
    pub entrypoint: String,
    #[serde(default)]
    pub value: Value,
}

/// One settlement (`collect`) call as returned by the events query
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub hash: String,
    #[serde(default)]
    pub level: i64,
    pub sender: AddressLike,
    pub target: AddressLike,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub parameter: Option<EventParameter>,
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    pub fn buyer(&self) -> Option<&str> {
        self.sender.as_address()
    }

    pub fn market(&self) -> Option<&str> {
        self.target.as_address()
    }
}

/// Page of events newer than a cursor
///
/// `high_water` is the largest id seen in the page, malformed rows included,
/// so a page made only of unparseable rows still moves the cursor.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    pub high_water: Option<i64>,
    pub skipped: usize,
}

impl EventPage {
    pub fn is_empty(&self) -> bool {
        self.high_water.is_none()
    }
}

/// Any operation inside a transaction group; only the id matters here
#[derive(Debug, Clone, Deserialize)]
pub struct TraceOperation {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationId {
    pub id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenMetadata {
    #[serde(default)]
    pub creators: Vec<AddressLike>,
    #[serde(default)]
    pub issuer: Option<AddressLike>,
}

impl TokenMetadata {
    /// `creators[0]`, then `issuer`
    pub fn declared_creator(&self) -> Option<String> {
        self.creators
            .first()
            .and_then(AddressLike::as_address)
            .or_else(|| self.issuer.as_ref().and_then(AddressLike::as_address))
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferToken {
    pub contract: AddressLike,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(default)]
    pub metadata: Option<TokenMetadata>,
}

/// Token transfer record linked to an operation through `transactionId`
#[derive(Debug, Clone, Deserialize)]
pub struct TransferRecord {
    pub id: i64,
    #[serde(default)]
    pub level: i64,
    #[serde(rename = "transactionId", default)]
    pub transaction_id: Option<i64>,
    #[serde(default)]
    pub to: Option<AddressLike>,
    pub token: TransferToken,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TransferRecord {
    pub fn recipient(&self) -> Option<&str> {
        self.to.as_ref().and_then(AddressLike::as_address)
    }

    pub fn token_ref(&self) -> Option<TokenRef> {
        let contract = self.token.contract.as_address()?;
        Some(TokenRef::new(contract, self.token.token_id.trim()))
    }
}

/// Token record used for canonical creator lookup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenInfo {
    #[serde(rename = "firstMinter", default)]
    pub first_minter: Option<AddressLike>,
    #[serde(default)]
    pub metadata: Option<TokenMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TokenRef {
    pub contract: String,
    pub token_id: String,
}

impl TokenRef {
    pub fn new(contract: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            token_id: token_id.into(),
        }
    }
}

/// A buyer paying a counterparty for a token, derived from one event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTransfer {
    pub event_id: i64,
    pub buyer: String,
    pub counterparty: String,
    pub token: TokenRef,
    pub amount_paid: i64,
    pub timestamp: DateTime<Utc>,
}

impl ResolvedTransfer {
    /// Identity of the underlying fact; ingesting it twice is a no-op
    pub fn dedupe_key(&self) -> (String, String, TokenRef, i64) {
        (
            self.buyer.clone(),
            self.counterparty.clone(),
            self.token.clone(),
            self.event_id,
        )
    }
}
