//! Ingestion: ledger events to durable trust edges

pub mod cache;
pub mod contracts;
pub mod cursor;
pub mod graph;
pub mod ledger;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod sync;
pub mod types;

pub use cursor::{CursorStore, CURSOR_KEY};
pub use graph::{edge_weight, Edge};
pub use ledger::{FetchError, LedgerClient};
pub use resolver::TraceResolver;
pub use store::{StoreError, TrustStore};
pub use sync::{CycleOutcome, SyncEngine, SyncError};
