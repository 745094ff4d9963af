//! Weighted trust edges

/// Weight of an edge after `trade_count` trades totalling `volume` native units.
///
/// `(1 + ln(1 + trade_count)) * (1 + 0.5 * ln(1 + volume / scale))`: strictly
/// increasing in both arguments, and 1.0 for an edge with no history.
pub fn edge_weight(trade_count: u64, volume: i64, scale: f64) -> f64 {
    let volume = volume.max(0) as f64;
    (1.0 + (trade_count as f64).ln_1p()) * (1.0 + 0.5 * (volume / scale).ln_1p())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub trade_count: u64,
    pub volume: i64,
    pub weight: f64,
}
