//! Marketplace contracts and their `collect` parameter shapes
//!
//! Each market version carries its own parameter layout. Rather than probing
//! fields at runtime, every version gets an explicit parser selected by the
//! contract address the event targeted.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const HEN_V1_ADDRESS: &str = "KT1Hkg5qeNhfwpKW4fXvq7HGZB9z2EnmCCA9";
pub const HEN_V2_ADDRESS: &str = "KT1HbQepzV1nVGg8QVznG7z4RcHseD5kwqBn";
pub const TEIA_ADDRESS: &str = "KT1PHubm9HtyQEJ4BBpMTVomq6mhbfNZ9z5w";

/// Settlement entrypoint indexed by the sync loop
pub const COLLECT_ENTRYPOINT: &str = "collect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketVersion {
    HenV1,
    HenV2,
    Teia,
}

impl MarketVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketVersion::HenV1 => "hen_v1",
            MarketVersion::HenV2 => "hen_v2",
            MarketVersion::Teia => "teia",
        }
    }

    /// Parse the raw `parameter.value` of a collect call for this version
    pub fn parse_collect(&self, value: &Value) -> Result<CollectParams, ParamError> {
        match self {
            MarketVersion::HenV1 => {
                let raw: HenV1Collect = serde_json::from_value(value.clone())
                    .map_err(|e| ParamError::Shape(*self, e.to_string()))?;
                let quantity = raw.objkt_amount.get();
                if quantity == 0 {
                    return Err(ParamError::Shape(*self, "objkt_amount is zero".to_string()));
                }
                Ok(CollectParams {
                    swap_id: raw.swap_id.get(),
                    quantity,
                })
            }
            // Both later markets take the bare swap id and sell one edition per call
            MarketVersion::HenV2 | MarketVersion::Teia => {
                let swap_id: Nat = serde_json::from_value(value.clone())
                    .map_err(|e| ParamError::Shape(*self, e.to_string()))?;
                Ok(CollectParams {
                    swap_id: swap_id.get(),
                    quantity: 1,
                })
            }
        }
    }
}

impl FromStr for MarketVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hen_v1" | "v1" => Ok(MarketVersion::HenV1),
            "hen_v2" | "v2" => Ok(MarketVersion::HenV2),
            "teia" => Ok(MarketVersion::Teia),
            other => Err(format!("unknown market version '{}'", other)),
        }
    }
}

impl fmt::Display for MarketVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketContract {
    pub version: MarketVersion,
    pub address: String,
}

impl MarketContract {
    pub fn new(version: MarketVersion, address: impl Into<String>) -> Self {
        Self {
            version,
            address: address.into(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(MarketVersion::HenV1, HEN_V1_ADDRESS),
            Self::new(MarketVersion::HenV2, HEN_V2_ADDRESS),
            Self::new(MarketVersion::Teia, TEIA_ADDRESS),
        ]
    }
}

/// Known markets, looked up by contract address
#[derive(Debug, Clone)]
pub struct MarketRegistry {
    markets: Vec<MarketContract>,
}

impl MarketRegistry {
    pub fn new(markets: Vec<MarketContract>) -> Self {
        Self { markets }
    }

    pub fn version_of(&self, address: &str) -> Option<MarketVersion> {
        self.markets
            .iter()
            .find(|m| m.address == address)
            .map(|m| m.version)
    }

    /// Comma-joined addresses for the `target.in` filter
    pub fn target_filter(&self) -> String {
        self.markets
            .iter()
            .map(|m| m.address.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Decoded `collect` arguments, uniform across versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectParams {
    pub swap_id: u64,
    pub quantity: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("{0} collect parameter has unexpected shape: {1}")]
    Shape(MarketVersion, String),
}

/// Michelson nat: the ledger API returns these as strings, older
/// snapshots sometimes as numbers
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Nat {
    Number(u64),
    Text(#[serde(deserialize_with = "nat_from_str")] u64),
}

impl Nat {
    fn get(self) -> u64 {
        match self {
            Nat::Number(n) | Nat::Text(n) => n,
        }
    }
}

fn nat_from_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.trim().parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct HenV1Collect {
    objkt_amount: Nat,
    swap_id: Nat,
}
