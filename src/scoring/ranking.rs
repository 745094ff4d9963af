use serde::Serialize;
use std::cmp::Ordering;

/// A participant's published score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedScore {
    pub address: String,
    /// Raw PageRank mass
    pub raw: f64,
    /// `raw / max(raw) * 100`
    pub score: f64,
    /// 1-based, by descending raw score, ties by address ascending
    pub rank: u32,
}

/// Normalize raw scores to `[0, 100]` and assign ranks
pub fn rank_scores<I>(raw: I) -> Vec<RankedScore>
where
    I: IntoIterator<Item = (String, f64)>,
{
    let mut entries: Vec<(String, f64)> = raw.into_iter().filter(|(_, s)| s.is_finite()).collect();
    entries.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let max = entries.first().map(|(_, s)| *s).unwrap_or(0.0);

    entries
        .into_iter()
        .enumerate()
        .map(|(i, (address, raw))| RankedScore {
            score: if max > 0.0 {
                (raw / max * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            },
            address,
            raw,
            rank: i as u32 + 1,
        })
        .collect()
}
