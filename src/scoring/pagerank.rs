//! Weighted PageRank over a snapshot of the edge table
//!
//! `new[v] = (1 - α) * p[v] + α * (D * p[v] + Σ_u score[u] * w(u→v) / outweight(u))`
//!
//! where `p` is the teleport distribution (uniform for global scores, all
//! mass on the seed for personalized scores) and `D` is the mass currently
//! sitting on dangling nodes. Dangling mass follows `p`, so the total stays 1.

use crate::config::ScoringConfig;
use crate::ingest::graph::Edge;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct PageRankResult {
    /// Address -> raw score
    pub scores: BTreeMap<String, f64>,
    pub iterations: usize,
    pub converged: bool,
    /// L1 change of the last iteration
    pub residual: f64,
}

/// Adjacency in a fixed node order (addresses ascending)
#[derive(Debug, Clone)]
pub struct TrustGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// Inbound links per node: (source index, weight)
    inbound: Vec<Vec<(usize, f64)>>,
    out_weight: Vec<f64>,
}

impl TrustGraph {
    pub fn from_edges(edges: &[Edge]) -> Self {
        let usable = || {
            edges
                .iter()
                .filter(|e| e.source != e.target && e.weight.is_finite() && e.weight > 0.0)
        };

        let nodes: Vec<String> = usable()
            .flat_map(|e| [e.source.clone(), e.target.clone()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        let mut inbound = vec![Vec::new(); nodes.len()];
        let mut out_weight = vec![0.0; nodes.len()];
        for edge in usable() {
            let (s, t) = (index[&edge.source], index[&edge.target]);
            inbound[t].push((s, edge.weight));
            out_weight[s] += edge.weight;
        }

        Self {
            nodes,
            index,
            inbound,
            out_weight,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    /// Global PageRank; sums to 1 for any non-empty graph
    pub fn global(&self, config: &ScoringConfig) -> PageRankResult {
        let n = self.nodes.len();
        if n == 0 {
            return PageRankResult {
                converged: true,
                ..Default::default()
            };
        }

        let teleport = vec![1.0 / n as f64; n];
        let (scores, iterations, converged, residual) = self.iterate(&teleport, teleport.clone(), config);

        PageRankResult {
            scores: self.nodes.iter().cloned().zip(scores).collect(),
            iterations,
            converged,
            residual,
        }
    }

    /// PageRank with every teleport (and all dangling mass) going to `seed`.
    ///
    /// Entries below `config.ppr_min_score` are omitted; an unknown seed
    /// yields an empty result.
    pub fn personalized(&self, seed: &str, config: &ScoringConfig) -> PageRankResult {
        let Some(&seed_idx) = self.index.get(seed) else {
            debug!("Personalized seed {} is not in the graph", seed);
            return PageRankResult {
                converged: true,
                ..Default::default()
            };
        };

        let mut teleport = vec![0.0; self.nodes.len()];
        teleport[seed_idx] = 1.0;
        let (scores, iterations, converged, residual) = self.iterate(&teleport, teleport.clone(), config);

        PageRankResult {
            scores: self
                .nodes
                .iter()
                .zip(scores)
                .filter(|(_, s)| *s >= config.ppr_min_score)
                .map(|(n, s)| (n.clone(), s))
                .collect(),
            iterations,
            converged,
            residual,
        }
    }

    fn iterate(&self, teleport: &[f64], start: Vec<f64>, config: &ScoringConfig) -> (Vec<f64>, usize, bool, f64) {
        let n = self.nodes.len();
        let alpha = config.alpha;
        let mut scores = start;
        let mut next = vec![0.0; n];
        let mut residual = f64::INFINITY;
        let mut iterations = 0;

        while iterations < config.max_iterations {
            iterations += 1;

            let dangling: f64 = (0..n)
                .filter(|&u| self.out_weight[u] == 0.0)
                .map(|u| scores[u])
                .sum();

            for v in 0..n {
                let inflow: f64 = self.inbound[v]
                    .iter()
                    .map(|&(u, w)| scores[u] * w / self.out_weight[u])
                    .sum();
                next[v] = (1.0 - alpha) * teleport[v] + alpha * (dangling * teleport[v] + inflow);
            }

            residual = scores.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
            std::mem::swap(&mut scores, &mut next);

            if residual < config.tolerance {
                break;
            }
        }

        let converged = residual < config.tolerance;
        if !converged {
            warn!(
                "⚠️  PageRank did not converge after {} iterations (residual {:.3e})",
                iterations, residual
            );
        }

        // Float drift only; the update preserves mass exactly in real arithmetic
        let total: f64 = scores.iter().sum();
        if total > 0.0 {
            scores.iter_mut().for_each(|s| *s /= total);
        }

        (scores, iterations, converged, residual)
    }
}
