pub mod config;
pub mod ingest;
pub mod scoring;
pub mod sqlite_pragma;

pub use config::{ConfigError, TrustConfig};
