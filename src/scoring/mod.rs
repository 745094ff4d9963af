//! Scoring: PageRank over the edge snapshot, ranking and publication

pub mod engine;
pub mod pagerank;
pub mod publisher;
pub mod ranking;

pub use engine::{ScoringJob, ScoringReport};
pub use pagerank::{PageRankResult, TrustGraph};
pub use publisher::{Generation, PublishedScore, ScorePublisher};
pub use ranking::{rank_scores, RankedScore};
