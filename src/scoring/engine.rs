//! Scoring job: edge snapshot -> PageRank -> ranked, published scores

use crate::config::ScoringConfig;
use crate::ingest::graph::edge_weight;
use crate::ingest::store::{StoreError, TrustStore};
use crate::scoring::pagerank::TrustGraph;
use crate::scoring::publisher::{GenerationMeta, ScorePublisher};
use crate::scoring::ranking::{rank_scores, RankedScore};
use log::info;
use serde::Serialize;
use std::time::Instant;

/// Summary of a published global run
#[derive(Debug, Clone, Serialize)]
pub struct ScoringReport {
    pub generation: i64,
    pub node_count: usize,
    pub edge_count: usize,
    pub iterations: usize,
    pub converged: bool,
    pub elapsed_ms: u64,
}

pub struct ScoringJob {
    store: TrustStore,
    publisher: ScorePublisher,
    config: ScoringConfig,
}

impl ScoringJob {
    pub fn new(store: TrustStore, config: ScoringConfig) -> Self {
        Self {
            publisher: ScorePublisher::new(store.clone()),
            store,
            config,
        }
    }

    pub fn publisher(&self) -> &ScorePublisher {
        &self.publisher
    }

    /// Edge snapshot, reweighted at the configured volume scale
    fn snapshot(&self) -> Result<(TrustGraph, usize), StoreError> {
        let mut edges = self.store.load_edges()?;
        for edge in &mut edges {
            edge.weight = edge_weight(edge.trade_count, edge.volume, self.config.volume_scale);
        }
        Ok((TrustGraph::from_edges(&edges), edges.len()))
    }

    /// Compute global scores and publish them as a new generation.
    ///
    /// Returns `None` without touching the published set when the graph is empty.
    pub fn run_global(&self) -> Result<Option<ScoringReport>, StoreError> {
        let started = Instant::now();
        let (graph, edge_count) = self.snapshot()?;

        if graph.is_empty() {
            info!("⚠️  No edges yet, skipping scoring run");
            return Ok(None);
        }

        info!(
            "🔧 Scoring {} participants over {} edges (α={})",
            graph.node_count(),
            edge_count,
            self.config.alpha
        );

        let result = graph.global(&self.config);
        let ranked = rank_scores(result.scores);
        let generation = self.publisher.publish(
            &ranked,
            GenerationMeta {
                node_count: graph.node_count(),
                iterations: result.iterations,
                converged: result.converged,
            },
        )?;

        let report = ScoringReport {
            generation,
            node_count: graph.node_count(),
            edge_count,
            iterations: result.iterations,
            converged: result.converged,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!("📊 Scoring run complete:");
        info!("   ├─ Generation: {}", report.generation);
        info!("   ├─ Iterations: {} (converged: {})", report.iterations, report.converged);
        info!("   └─ Elapsed: {}ms", report.elapsed_ms);
        Ok(Some(report))
    }

    /// Scores from `seed`'s point of view. Computed on demand, never persisted.
    pub fn personalized(&self, seed: &str) -> Result<Vec<RankedScore>, StoreError> {
        let (graph, _) = self.snapshot()?;
        let result = graph.personalized(seed, &self.config);
        Ok(rank_scores(result.scores))
    }
}
