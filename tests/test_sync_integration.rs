//! End-to-end ingestion against a fake ledger API
//!
//! Covers the A/B/C scenario, replay idempotence, retry and deferral
//! behaviour, cold start modes and trace attribution edge cases.

mod common;

use common::{abc_scenario, test_config, transfer, FakeLedger};
use serde_json::json;
use std::collections::BTreeMap;
use tempfile::tempdir;
use trustflow::config::ColdStart;
use trustflow::ingest::contracts::TEIA_ADDRESS;
use trustflow::ingest::{CursorStore, CycleOutcome, SyncEngine, SyncError, TrustStore, CURSOR_KEY};
use trustflow::TrustConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn open(config: &TrustConfig) -> TrustStore {
    TrustStore::open(&config.db_path, config.scoring.volume_scale).unwrap()
}

/// Run cycles until the engine reports it is caught up
async fn drain(engine: &mut SyncEngine) -> usize {
    let mut batches = 0;
    loop {
        match engine.run_cycle().await.unwrap() {
            CycleOutcome::CaughtUp { .. } => return batches,
            CycleOutcome::Advanced { .. } => batches += 1,
        }
        assert!(batches < 100, "sync did not converge");
    }
}

fn edge_counts(store: &TrustStore) -> BTreeMap<(String, String), u64> {
    store
        .load_edges()
        .unwrap()
        .into_iter()
        .map(|e| ((e.source, e.target), e.trade_count))
        .collect()
}

fn pair(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

#[tokio::test]
async fn test_scenario_builds_expected_edges() {
    let server = MockServer::start().await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let mut config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    config.sync.batch_size = 2;
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    assert_eq!(drain(&mut engine).await, 3);

    let edges = edge_counts(&store);
    assert_eq!(edges.len(), 3);
    assert_eq!(edges[&pair("A", "B")], 2);
    assert_eq!(edges[&pair("A", "C")], 2);
    assert_eq!(edges[&pair("B", "C")], 1);
    assert!(store.load_edges().unwrap().iter().all(|e| e.source != e.target));

    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(105));

    let ab = store
        .load_edges()
        .unwrap()
        .into_iter()
        .find(|e| e.source == "A" && e.target == "B")
        .unwrap();
    assert_eq!(ab.volume, 3_000_000);
}

#[tokio::test]
async fn test_cursor_is_monotonic_across_batches() {
    let server = MockServer::start().await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let mut config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    config.sync.batch_size = 1;
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    let mut last = 100;
    while let CycleOutcome::Advanced { from, to, .. } = engine.run_cycle().await.unwrap() {
        assert_eq!(from, last);
        assert!(to > from);
        assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(to));
        last = to;
    }
    assert_eq!(last, 105);
}

#[tokio::test]
async fn test_replay_from_committed_cursor_is_idempotent() {
    let server = MockServer::start().await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut engine).await;

    let edges_before = store.load_edges().unwrap();
    let trades_before = store.stats().unwrap().trade_count;

    // Simulate a crash that lost the cursor write after the edges committed
    store.set(CURSOR_KEY, 102).await.unwrap();
    let mut restarted = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut restarted).await;

    assert_eq!(store.load_edges().unwrap(), edges_before);
    assert_eq!(store.stats().unwrap().trade_count, trades_before);
    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(105));
}

#[tokio::test]
async fn test_rate_limit_is_retried_within_the_cycle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/operations/transactions"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    match engine.run_cycle().await.unwrap() {
        CycleOutcome::Advanced { to, facts, .. } => {
            assert_eq!(to, 105);
            assert_eq!(facts, 5);
        }
        other => panic!("expected the batch to go through, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_defers_batch_without_moving_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/tokens/transfers"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    let err = engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch(_)));

    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(100));
    assert!(store.load_edges().unwrap().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_defer_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/operations/op101"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    assert!(engine.run_cycle().await.is_err());
    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(100));
    assert_eq!(store.stats().unwrap().trade_count, 0);
}

#[tokio::test]
async fn test_cold_start_genesis_indexes_everything() {
    let server = MockServer::start().await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), None);
    assert_eq!(config.sync.cold_start, ColdStart::Genesis);
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    drain(&mut engine).await;
    assert_eq!(edge_counts(&store).len(), 3);
    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(105));
}

#[tokio::test]
async fn test_cold_start_tip_skips_history() {
    let server = MockServer::start().await;
    abc_scenario().mount(&server).await;

    let dir = tempdir().unwrap();
    let mut config = test_config(&server, &dir.path().join("sync.db"), None);
    config.sync.cold_start = ColdStart::Tip;
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    assert_eq!(
        engine.run_cycle().await.unwrap(),
        CycleOutcome::CaughtUp { cursor: Some(105) }
    );
    assert!(store.load_edges().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_upstream_is_caught_up() {
    let server = MockServer::start().await;
    FakeLedger::default().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), None);
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    assert_eq!(
        engine.run_cycle().await.unwrap(),
        CycleOutcome::CaughtUp { cursor: None }
    );
    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), None);
}

#[tokio::test]
async fn test_malformed_and_self_transfers_are_skipped() {
    let server = MockServer::start().await;
    let mut ledger = FakeLedger::default();
    ledger
        .collect(101, "A", "B", 1_000)
        // Teia takes a bare swap id; an object is malformed
        .push_event(102, "A", TEIA_ADDRESS, json!({"swap_id": "1"}), 1_000)
        // Buying your own work
        .collect(103, "C", "C", 1_000)
        .collect_v1(104, "D", "B", 1_000);
    ledger.mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut engine).await;

    let edges = edge_counts(&store);
    assert_eq!(edges.len(), 2);
    assert!(edges.contains_key(&pair("A", "B")));
    assert!(edges.contains_key(&pair("D", "B")));
    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(104));
}

#[tokio::test]
async fn test_transfer_attributed_to_matching_sender_in_shared_group() {
    let server = MockServer::start().await;
    let mut ledger = FakeLedger::default();
    // Two collects batched into one group "op101"; the transfer goes to E
    ledger
        .push_event(101, "D", TEIA_ADDRESS, json!("1"), 5_000)
        .push_event(102, "E", TEIA_ADDRESS, json!("2"), 7_000);
    ledger.events[1]["hash"] = json!("op101");
    ledger.traces.insert("op101".to_string(), vec![1010, 1011]);
    ledger.transfers.push(transfer(9_101, Some(1011), 1_101, "E", "42", None));
    ledger.minters.insert("42".to_string(), "F".to_string());
    ledger.mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut engine).await;

    let edges = store.load_edges().unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source, "E");
    assert_eq!(edges[0].target, "F");
    assert_eq!(edges[0].volume, 7_000);
}

fn level_fallback_ledger() -> FakeLedger {
    let mut ledger = FakeLedger::default();
    ledger.push_event(101, "A", TEIA_ADDRESS, json!("7"), 1_000);
    // The trace has no operation linked to any transfer
    ledger.traces.insert("op101".to_string(), vec![1010]);
    // ...but a transfer to the buyer exists in the same block
    ledger.transfers.push(transfer(9_101, None, 1_101, "A", "7", None));
    ledger.minters.insert("7".to_string(), "B".to_string());
    ledger
}

#[tokio::test]
async fn test_level_fallback_is_diagnostic_by_default() {
    let server = MockServer::start().await;
    level_fallback_ledger().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut engine).await;

    assert!(store.load_edges().unwrap().is_empty());
    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(101));
}

#[tokio::test]
async fn test_level_fallback_when_enabled() {
    let server = MockServer::start().await;
    level_fallback_ledger().mount(&server).await;

    let dir = tempdir().unwrap();
    let mut config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    config.sync.accept_level_fallback = true;
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut engine).await;

    let edges = edge_counts(&store);
    assert_eq!(edges.get(&pair("A", "B")), Some(&1));
}

#[tokio::test]
async fn test_token_without_creator_uses_embedded_metadata() {
    let server = MockServer::start().await;
    let mut ledger = FakeLedger::default();
    ledger.push_event(101, "A", TEIA_ADDRESS, json!("9"), 1_000);
    ledger.traces.insert("op101".to_string(), vec![1010, 1011]);
    // No minter registered: the token lookup succeeds with no rows
    ledger.transfers.push(transfer(
        9_101,
        Some(1011),
        1_101,
        "A",
        "9",
        Some(json!({"creators": [], "issuer": "G"})),
    ));
    ledger.mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut engine).await;

    let edges = edge_counts(&store);
    assert_eq!(edges.get(&pair("A", "G")), Some(&1));
}

#[tokio::test]
async fn test_token_lookup_failure_defers_batch_and_replay_is_stable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/tokens"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let mut ledger = FakeLedger::default();
    ledger.push_event(101, "A", TEIA_ADDRESS, json!("9"), 1_000);
    ledger.traces.insert("op101".to_string(), vec![1010, 1011]);
    ledger.transfers.push(transfer(
        9_101,
        Some(1011),
        1_101,
        "A",
        "9",
        Some(json!({"creators": [{"address": "E"}]})),
    ));
    ledger.minters.insert("9".to_string(), "M".to_string());
    ledger.mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();

    let err = engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch(_)));
    assert_eq!(store.get(CURSOR_KEY).await.unwrap(), Some(100));
    assert_eq!(store.stats().unwrap().trade_count, 0);

    drain(&mut engine).await;
    let edges_before = store.load_edges().unwrap();
    assert_eq!(edge_counts(&store), BTreeMap::from([(pair("A", "M"), 1)]));

    // Replaying the batch resolves the same counterparty
    store.set(CURSOR_KEY, 100).await.unwrap();
    let mut restarted = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut restarted).await;

    assert_eq!(store.load_edges().unwrap(), edges_before);
    assert_eq!(store.stats().unwrap().trade_count, 1);
}

#[tokio::test]
async fn test_buyer_is_the_transfer_recipient() {
    let server = MockServer::start().await;
    let mut ledger = FakeLedger::default();
    ledger.collect(101, "A", "B", 4_000);
    // The same group also moves token 900 to F
    ledger.traces.insert("op101".to_string(), vec![1010, 1011, 1012]);
    ledger.transfers.push(transfer(9_900, Some(1012), 1_101, "F", "900", None));
    ledger.minters.insert("900".to_string(), "Z".to_string());
    ledger.mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);
    let mut engine = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    drain(&mut engine).await;

    let edges = edge_counts(&store);
    assert_eq!(edges.len(), 2);
    assert_eq!(edges.get(&pair("A", "B")), Some(&1));
    assert_eq!(edges.get(&pair("F", "Z")), Some(&1));
    assert!(!edges.contains_key(&pair("A", "Z")));
}

#[tokio::test]
async fn test_writer_lease_blocks_second_engine() {
    let server = MockServer::start().await;
    FakeLedger::default().mount(&server).await;

    let dir = tempdir().unwrap();
    let config = test_config(&server, &dir.path().join("sync.db"), Some(100));
    let store = open(&config);

    let first = SyncEngine::new(config.sync.clone(), store.clone()).unwrap();
    let second = SyncEngine::new(config.sync.clone(), open(&config)).unwrap();

    first.acquire_lease().unwrap();
    assert!(second.acquire_lease().is_err());

    first.release_lease().unwrap();
    second.acquire_lease().unwrap();
}
