//! Runtime configuration from environment variables
//!
//! Both binaries call [`TrustConfig::from_env`] after `dotenv`. Parsing goes
//! through a lookup closure so tests can feed a map instead of mutating the
//! process environment.

use crate::ingest::contracts::{MarketContract, MarketVersion};
use crate::ingest::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Where the sync loop starts when no cursor has been committed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStart {
    /// Just before the earliest relevant event
    Genesis,
    /// At the newest relevant event, only new activity is indexed
    Tip,
}

impl FromStr for ColdStart {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "genesis" => Ok(ColdStart::Genesis),
            "tip" => Ok(ColdStart::Tip),
            other => Err(ConfigError::InvalidValue(format!(
                "SYNC_COLD_START must be 'genesis' or 'tip', got '{}'",
                other
            ))),
        }
    }
}

/// Settings for the ledger client and the sync loop
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub markets: Vec<MarketContract>,
    pub batch_size: usize,
    pub idle_delay: Duration,
    pub error_delay: Duration,
    pub rate_limit_delay: Duration,
    pub cold_start: ColdStart,
    pub start_cursor: Option<i64>,
    pub lease: Duration,
    pub http_timeout: Duration,
    pub retry: RetryPolicy,
    pub trace_chunk_size: usize,
    pub transfer_chunk_size: usize,
    pub fetch_concurrency: usize,
    pub creator_cache_capacity: usize,
    pub accept_level_fallback: bool,
}

/// PageRank and edge-weight settings
#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig {
    pub alpha: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub ppr_min_score: f64,
    pub volume_scale: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            alpha: 0.85,
            tolerance: 1e-8,
            max_iterations: 200,
            ppr_min_score: 1e-5,
            volume_scale: 1_000_000.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub db_path: String,
    pub sync: SyncConfig,
    pub scoring: ScoringConfig,
}

impl TrustConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (defaults in parentheses):
    /// - `TRUST_DB_PATH` (trust_network.db)
    /// - `LEDGER_API_URL` (https://api.tzkt.io)
    /// - `TRUST_MARKET_CONTRACTS` (hen_v1, hen_v2 and teia marketplaces)
    /// - `SYNC_BATCH_SIZE` (100), `SYNC_IDLE_SECS` (10), `SYNC_ERROR_DELAY_SECS` (5),
    ///   `SYNC_RATE_LIMIT_MS` (1000), `SYNC_COLD_START` (genesis), `SYNC_START_CURSOR`,
    ///   `SYNC_LEASE_SECS` (120)
    /// - `HTTP_TIMEOUT_SECS` (30), `RETRY_MAX_ATTEMPTS` (3), `RETRY_BASE_DELAY_MS` (1000),
    ///   `RETRY_MAX_DELAY_MS` (30000)
    /// - `TRACE_CHUNK_SIZE` (10), `TRANSFER_CHUNK_SIZE` (100), `FETCH_CONCURRENCY` (4),
    ///   `CREATOR_CACHE_CAPACITY` (10000), `ACCEPT_LEVEL_FALLBACK` (false)
    /// - `EDGE_VOLUME_SCALE` (1000000), `PAGERANK_ALPHA` (0.85), `PAGERANK_TOLERANCE` (1e-8),
    ///   `PAGERANK_MAX_ITER` (200), `PPR_MIN_SCORE` (1e-5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("LEDGER_API_URL")
            .unwrap_or_else(|| "https://api.tzkt.io".to_string())
            .trim_end_matches('/')
            .to_string();

        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "LEDGER_API_URL must start with http:// or https://".to_string(),
            ));
        }

        let markets = match lookup("TRUST_MARKET_CONTRACTS") {
            Some(raw) => parse_markets(&raw)?,
            None => MarketContract::defaults(),
        };
        if markets.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TRUST_MARKET_CONTRACTS must name at least one contract".to_string(),
            ));
        }

        let cold_start = match lookup("SYNC_COLD_START") {
            Some(raw) => raw.parse()?,
            None => ColdStart::Genesis,
        };

        let start_cursor = match lookup("SYNC_START_CURSOR") {
            Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
                ConfigError::InvalidValue(format!("SYNC_START_CURSOR is not an integer: {}", raw))
            })?),
            None => None,
        };

        let retry = RetryPolicy::new(
            parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 3u32).max(1),
            Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 1_000u64)),
            Duration::from_millis(parse_or(&lookup, "RETRY_MAX_DELAY_MS", 30_000u64)),
        );

        let sync = SyncConfig {
            api_url,
            markets,
            batch_size: parse_or(&lookup, "SYNC_BATCH_SIZE", 100usize).max(1),
            idle_delay: Duration::from_secs(parse_or(&lookup, "SYNC_IDLE_SECS", 10u64)),
            error_delay: Duration::from_secs(parse_or(&lookup, "SYNC_ERROR_DELAY_SECS", 5u64)),
            rate_limit_delay: Duration::from_millis(parse_or(&lookup, "SYNC_RATE_LIMIT_MS", 1_000u64)),
            cold_start,
            start_cursor,
            lease: Duration::from_secs(parse_or(&lookup, "SYNC_LEASE_SECS", 120u64)),
            http_timeout: Duration::from_secs(parse_or(&lookup, "HTTP_TIMEOUT_SECS", 30u64)),
            retry,
            trace_chunk_size: parse_or(&lookup, "TRACE_CHUNK_SIZE", 10usize).max(1),
            transfer_chunk_size: parse_or(&lookup, "TRANSFER_CHUNK_SIZE", 100usize).max(1),
            fetch_concurrency: parse_or(&lookup, "FETCH_CONCURRENCY", 4usize).max(1),
            creator_cache_capacity: parse_or(&lookup, "CREATOR_CACHE_CAPACITY", 10_000usize).max(1),
            accept_level_fallback: parse_or(&lookup, "ACCEPT_LEVEL_FALLBACK", false),
        };

        let defaults = ScoringConfig::default();
        let scoring = ScoringConfig {
            alpha: parse_or(&lookup, "PAGERANK_ALPHA", defaults.alpha),
            tolerance: parse_or(&lookup, "PAGERANK_TOLERANCE", defaults.tolerance),
            max_iterations: parse_or(&lookup, "PAGERANK_MAX_ITER", defaults.max_iterations).max(1),
            ppr_min_score: parse_or(&lookup, "PPR_MIN_SCORE", defaults.ppr_min_score),
            volume_scale: parse_or(&lookup, "EDGE_VOLUME_SCALE", defaults.volume_scale),
        };

        if !(0.0..1.0).contains(&scoring.alpha) {
            return Err(ConfigError::InvalidValue(format!(
                "PAGERANK_ALPHA must be in [0, 1), got {}",
                scoring.alpha
            )));
        }
        if scoring.volume_scale <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "EDGE_VOLUME_SCALE must be positive".to_string(),
            ));
        }

        Ok(Self {
            db_path: lookup("TRUST_DB_PATH").unwrap_or_else(|| "trust_network.db".to_string()),
            sync,
            scoring,
        })
    }
}

/// Parse a `version:address` list, e.g. `teia:KT1PHub...,hen_v2:KT1HbQ...`
fn parse_markets(raw: &str) -> Result<Vec<MarketContract>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (version, address) = entry.split_once(':').ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "market entry '{}' must look like version:address",
                    entry
                ))
            })?;
            let version: MarketVersion = version
                .parse()
                .map_err(|e: String| ConfigError::InvalidValue(e))?;
            Ok(MarketContract::new(version, address.trim()))
        })
        .collect()
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', defaulting to {:?}", key, raw, default);
                default
            }
        },
        None => default,
    }
}
