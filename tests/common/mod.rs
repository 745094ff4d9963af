//! Fake ledger API for integration tests
//!
//! Serves settlement events, transaction traces, token transfers and token
//! records from in-memory fixtures, honouring the query parameters the sync
//! loop sends (`id.gt`, `limit`, `sort.desc`, `transactionId.in`, `level`,
//! `tokenId`).

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use trustflow::config::TrustConfig;
use trustflow::ingest::contracts::{HEN_V1_ADDRESS, TEIA_ADDRESS};
use trustflow::ingest::retry::RetryPolicy;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const OBJKTS: &str = "KT1RJ6PbjHpwc3M5rw5s2Nbmefwbuwbdxton";

#[derive(Default, Clone)]
pub struct FakeLedger {
    pub events: Vec<Value>,
    /// hash -> operation ids in that group
    pub traces: HashMap<String, Vec<i64>>,
    pub transfers: Vec<Value>,
    /// tokenId -> firstMinter
    pub minters: HashMap<String, String>,
}

impl FakeLedger {
    /// Teia collect `id` by `buyer` of token `id`, minted by `creator`.
    ///
    /// Group hash is `op<id>`; the collect is operation `id*10` and the token
    /// moves in operation `id*10 + 1`.
    pub fn collect(&mut self, id: i64, buyer: &str, creator: &str, amount: i64) -> &mut Self {
        self.push_event(id, buyer, TEIA_ADDRESS, json!(id.to_string()), amount);
        self.traces.insert(format!("op{}", id), vec![id * 10, id * 10 + 1]);
        self.transfers.push(transfer(9_000 + id, Some(id * 10 + 1), 1_000 + id, buyer, &id.to_string(), None));
        self.minters.insert(id.to_string(), creator.to_string());
        self
    }

    pub fn push_event(&mut self, id: i64, buyer: &str, market: &str, parameter: Value, amount: i64) -> &mut Self {
        self.events.push(json!({
            "id": id,
            "hash": format!("op{}", id),
            "level": 1_000 + id,
            "sender": {"address": buyer},
            "target": {"address": market},
            "amount": amount,
            "parameter": {"entrypoint": "collect", "value": parameter},
            "timestamp": "2021-06-01T12:00:00Z"
        }));
        self
    }

    /// hen_v1 collect with the structured parameter
    pub fn collect_v1(&mut self, id: i64, buyer: &str, creator: &str, amount: i64) -> &mut Self {
        self.push_event(
            id,
            buyer,
            HEN_V1_ADDRESS,
            json!({"objkt_amount": "1", "swap_id": id.to_string()}),
            amount,
        );
        self.traces.insert(format!("op{}", id), vec![id * 10, id * 10 + 1]);
        self.transfers.push(transfer(9_000 + id, Some(id * 10 + 1), 1_000 + id, buyer, &id.to_string(), None));
        self.minters.insert(id.to_string(), creator.to_string());
        self
    }

    pub async fn mount(&self, server: &MockServer) {
        let shared = Arc::new(self.clone());

        let ledger = Arc::clone(&shared);
        Mock::given(method("GET"))
            .and(path("/v1/operations/transactions"))
            .respond_with(move |req: &Request| ledger.events_response(req))
            .mount(server)
            .await;

        let ledger = Arc::clone(&shared);
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/operations/op\d+$"))
            .respond_with(move |req: &Request| ledger.trace_response(req))
            .mount(server)
            .await;

        let ledger = Arc::clone(&shared);
        Mock::given(method("GET"))
            .and(path("/v1/tokens/transfers"))
            .respond_with(move |req: &Request| ledger.transfers_response(req))
            .mount(server)
            .await;

        let ledger = Arc::clone(&shared);
        Mock::given(method("GET"))
            .and(path("/v1/tokens"))
            .respond_with(move |req: &Request| ledger.token_response(req))
            .mount(server)
            .await;
    }

    fn events_response(&self, req: &Request) -> ResponseTemplate {
        let after = param(req, "id.gt").and_then(|v| v.parse::<i64>().ok()).unwrap_or(i64::MIN);
        let limit = param(req, "limit").and_then(|v| v.parse::<usize>().ok()).unwrap_or(100);

        let mut rows: Vec<Value> = self
            .events
            .iter()
            .filter(|e| e["id"].as_i64().map_or(false, |id| id > after))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e["id"].as_i64());
        if param(req, "sort.desc").is_some() {
            rows.reverse();
        }
        rows.truncate(limit);

        ResponseTemplate::new(200).set_body_json(Value::Array(rows))
    }

    fn trace_response(&self, req: &Request) -> ResponseTemplate {
        let hash = req.url.path().rsplit('/').next().unwrap_or_default();
        let ops: Vec<Value> = self
            .traces
            .get(hash)
            .map(|ids| ids.iter().map(|id| json!({"id": id, "type": "transaction"})).collect())
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(Value::Array(ops))
    }

    fn transfers_response(&self, req: &Request) -> ResponseTemplate {
        let rows: Vec<Value> = if let Some(ids) = param(req, "transactionId.in") {
            let ids: Vec<i64> = ids.split(',').filter_map(|s| s.parse().ok()).collect();
            self.transfers
                .iter()
                .filter(|t| t["transactionId"].as_i64().map_or(false, |id| ids.contains(&id)))
                .cloned()
                .collect()
        } else if let Some(level) = param(req, "level").and_then(|v| v.parse::<i64>().ok()) {
            self.transfers
                .iter()
                .filter(|t| t["level"].as_i64() == Some(level))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        ResponseTemplate::new(200).set_body_json(Value::Array(rows))
    }

    fn token_response(&self, req: &Request) -> ResponseTemplate {
        let rows: Vec<Value> = param(req, "tokenId")
            .and_then(|id| self.minters.get(&id))
            .map(|minter| vec![json!({"firstMinter": {"address": minter}, "metadata": {}})])
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(Value::Array(rows))
    }
}

pub fn transfer(
    id: i64,
    transaction_id: Option<i64>,
    level: i64,
    to: &str,
    token_id: &str,
    metadata: Option<Value>,
) -> Value {
    let mut token = json!({"contract": {"address": OBJKTS}, "tokenId": token_id});
    if let Some(metadata) = metadata {
        token["metadata"] = metadata;
    }
    let mut record = json!({
        "id": id,
        "level": level,
        "to": {"address": to},
        "token": token,
        "timestamp": "2021-06-01T12:00:00Z"
    });
    if let Some(tx) = transaction_id {
        record["transactionId"] = json!(tx);
    }
    record
}

fn param(req: &Request, key: &str) -> Option<String> {
    req.url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// The A/B/C scenario: A→B twice, B→C once, A→C twice
pub fn abc_scenario() -> FakeLedger {
    let mut ledger = FakeLedger::default();
    ledger
        .collect(101, "A", "B", 1_000_000)
        .collect(102, "A", "B", 2_000_000)
        .collect(103, "B", "C", 500_000)
        .collect(104, "A", "C", 1_000_000)
        .collect(105, "A", "C", 1_000_000);
    ledger
}

/// Config pointed at `server` with fast retries and an explicit start cursor
pub fn test_config(server: &MockServer, db_path: &std::path::Path, start: Option<i64>) -> TrustConfig {
    let mut config = TrustConfig::from_lookup(|_| None).expect("default config");
    config.db_path = db_path.display().to_string();
    config.sync.api_url = server.uri();
    config.sync.start_cursor = start;
    config.sync.retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
    config.sync.idle_delay = Duration::from_millis(1);
    config.sync.error_delay = Duration::from_millis(1);
    config.sync.rate_limit_delay = Duration::ZERO;
    config
}
