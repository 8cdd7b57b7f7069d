//! Memory tiers
//!
//! | Tier | Type           | Holds                     | Backing stores           |
//! |------|----------------|---------------------------|--------------------------|
//! | L1   | `ActiveTier`   | recent turns per session  | KV (fast) + documents    |
//! | L2   | `WorkingTier`  | facts above CIAR threshold| documents                |
//! | L3   | `EpisodicTier` | consolidated episodes     | vector + graph (dual)    |
//! | L4   | `SemanticTier` | distilled knowledge       | documents + full-text    |
//!
//! Every tier implements `MemoryTier`. The orchestrator holds one concrete
//! handle per tier and reaches all of them through the same contract.

pub mod active;
pub mod episodic;
pub mod semantic;
pub mod working;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use active::ActiveTier;
pub use episodic::{EpisodicTier, NewEpisode};
pub use semantic::{SemanticTier, UpsertOutcome};
pub use working::WorkingTier;

use crate::errors::Result;
use crate::storage::AdapterHealth;

/// The four tiers, in promotion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TierKind {
    Active,
    Working,
    Episodic,
    Semantic,
}

impl TierKind {
    pub const ALL: [TierKind; 4] = [
        TierKind::Active,
        TierKind::Working,
        TierKind::Episodic,
        TierKind::Semantic,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TierKind::Active => "l1",
            TierKind::Working => "l2",
            TierKind::Episodic => "l3",
            TierKind::Semantic => "l4",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one tier, rolled up from its adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierHealth {
    pub tier: TierKind,
    pub status: HealthStatus,
    pub adapters: Vec<AdapterHealth>,
}

impl TierHealth {
    /// All adapters healthy: healthy. Some: degraded. None: unhealthy.
    pub fn from_adapters(tier: TierKind, adapters: Vec<AdapterHealth>) -> Self {
        let healthy = adapters.iter().filter(|a| a.healthy).count();
        let status = if healthy == adapters.len() {
            HealthStatus::Healthy
        } else if healthy == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            tier,
            status,
            adapters,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Filters accepted by `MemoryTier::query`; tiers ignore what they can't use
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub session_id: Option<String>,
    /// Full-text query (L4) or term-overlap filter (L1)
    pub text: Option<String>,
    /// Similarity query (L2, L3)
    pub embedding: Option<Vec<f32>>,
    /// Only records at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Minimum CIAR score (L2)
    pub min_score: Option<f32>,
    /// Include facts already folded into an episode (L2)
    pub include_consolidated: bool,
    /// Include archived documents (L4)
    pub include_archived: bool,
}

impl QueryFilters {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::default()
        }
    }
}

/// Read-path request fanned out to every enabled tier
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub session_id: String,
    pub query: String,
    pub embedding: Vec<f32>,
    pub limit: usize,
}

/// One tier's candidate for the assembled context
///
/// `score` is the tier's own relevance signal; the orchestrator min-max
/// normalizes it per tier before weighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCandidate {
    pub tier: TierKind,
    pub id: String,
    pub content: String,
    pub score: f32,
    pub timestamp: DateTime<Utc>,
}

/// Uniform tier contract
#[async_trait]
pub trait MemoryTier: Send + Sync {
    /// What `store` accepts
    type Input: Send + Sync;
    /// What reads return
    type Record: Send + Sync;

    fn kind(&self) -> TierKind;

    async fn store(&self, input: Self::Input) -> Result<String>;

    async fn retrieve(&self, id: &str) -> Result<Option<Self::Record>>;

    async fn query(&self, filters: &QueryFilters, limit: usize) -> Result<Vec<Self::Record>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn health_check(&self) -> TierHealth;

    /// Scored candidates for the hybrid read path
    async fn context_candidates(&self, request: &ContextRequest) -> Result<Vec<ContextCandidate>>;
}

/// Lowercased alphanumeric terms, for cheap lexical overlap scoring
pub(crate) fn terms(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Share of query terms present in `text`
pub(crate) fn term_overlap(query: &str, text: &str) -> f32 {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = terms(text);
    let hits = query_terms.iter().filter(|t| text_terms.contains(*t)).count();
    hits as f32 / query_terms.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_rollup() {
        let all_ok = TierHealth::from_adapters(
            TierKind::Episodic,
            vec![AdapterHealth::ok("vector"), AdapterHealth::ok("graph")],
        );
        assert_eq!(all_ok.status, HealthStatus::Healthy);

        let partial = TierHealth::from_adapters(
            TierKind::Episodic,
            vec![AdapterHealth::ok("vector"), AdapterHealth::failed("graph", "down")],
        );
        assert_eq!(partial.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_term_overlap() {
        assert_eq!(term_overlap("python scripts", "I write Python scripts daily"), 1.0);
        assert_eq!(term_overlap("rust", "nothing here"), 0.0);
    }
}
